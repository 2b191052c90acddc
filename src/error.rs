use std::any::Any;
use std::fmt;

use sea_orm::Value;
use thiserror::Error;

/// Errors returned by the tree engines.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A candidate node collides with an existing node on a unique property set.
    /// Recoverable: retry with different values.
    #[error("{0}")]
    UniquenessViolation(UniqueViolation),

    /// The caller asked for something structurally impossible, e.g. moving a
    /// node below itself or adding a node that is already part of the tree.
    #[error("structural precondition failed: {0}")]
    StructuralPrecondition(String),

    /// The stored index data contradicts the tree invariants.
    #[error("tree integrity corrupted: {0}")]
    IntegrityCorruption(String),

    #[error("invalid tree configuration: {0}")]
    InvalidConfiguration(String),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl TreeError {
    pub fn precondition(detail: impl Into<String>) -> Self {
        Self::StructuralPrecondition(detail.into())
    }

    pub fn corruption(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        tracing::warn!(%detail, "tree integrity corrupted");
        Self::IntegrityCorruption(detail)
    }

    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::InvalidConfiguration(detail.into())
    }

    /// The violation payload, when this is a uniqueness error.
    pub fn as_violation(&self) -> Option<&UniqueViolation> {
        match self {
            Self::UniquenessViolation(violation) => Some(violation),
            _ => None,
        }
    }
}

/// Payload of [`TreeError::UniquenessViolation`].
///
/// Holds the rejected clone so the caller can inspect it, fix the offending
/// values and try again.
pub struct UniqueViolation {
    entity: String,
    values: Vec<(String, Value)>,
    candidate: Box<dyn Any + Send + Sync>,
}

impl UniqueViolation {
    pub(crate) fn new<A>(entity: impl Into<String>, values: Vec<(String, Value)>, candidate: A) -> Self
    where
        A: Any + Send + Sync,
    {
        Self {
            entity: entity.into(),
            values,
            candidate: Box::new(candidate),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Column/value pairs of the rejected candidate that take part in the constraint.
    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }

    /// The rejected clone, typically the model's `ActiveModel`.
    pub fn candidate<A: Any>(&self) -> Option<&A> {
        self.candidate.downcast_ref::<A>()
    }
}

impl fmt::Debug for UniqueViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueViolation")
            .field("entity", &self.entity)
            .field("values", &self.values)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for UniqueViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unique constraint violated on {}", self.entity)?;
        for (index, (column, value)) in self.values.iter().enumerate() {
            let separator = if index == 0 { ": " } else { ", " };
            write!(f, "{separator}{column} = {value:?}")?;
        }
        Ok(())
    }
}
