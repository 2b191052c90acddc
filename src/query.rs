//! Predicate fragments shared by both engines: criteria equality and
//! validity-window filtering.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::ValueType;
use sea_orm::{ColumnTrait, Condition, EntityTrait, ModelTrait, Value};

/// How validity predicates apply to a read.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum QueryMode {
    /// Only rows valid now.
    #[default]
    Valid,
    /// No validity filtering; administrative reads and physical housekeeping.
    All,
    /// Only rows that have been historicized.
    Removed,
}

/// Conjunction of column equalities used by `find`.
///
/// A null value matches rows where the column is null.
#[derive(Clone, Debug)]
pub struct Criteria<E: EntityTrait> {
    terms: Vec<(E::Column, Value)>,
}

impl<E: EntityTrait> Default for Criteria<E> {
    fn default() -> Self {
        Self { terms: Vec::new() }
    }
}

impl<E: EntityTrait> Criteria<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: E::Column, value: impl Into<Value>) -> Self {
        self.terms.push((column, value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn condition(&self) -> Condition {
        self.terms
            .iter()
            .fold(Condition::all(), |condition, (column, value)| {
                condition.add(equality(*column, value.clone()))
            })
    }
}

/// `column = value`, or `column IS NULL` for a null value.
pub(crate) fn equality<C: ColumnTrait>(column: C, value: Value) -> Condition {
    if is_null(&value) {
        Condition::all().add(column.is_null())
    } else {
        Condition::all().add(column.eq(value))
    }
}

pub(crate) fn is_null(value: &Value) -> bool {
    *value == value.as_null()
}

/// Validity window columns of a temporal carrier entity.
///
/// A row is valid at `T` when `valid_from` is null or not after `T`, and
/// `valid_to` is null or after `T`.
#[derive(Clone, Debug)]
pub struct Validity<E: EntityTrait> {
    valid_from: Option<E::Column>,
    valid_to: E::Column,
}

impl<E: EntityTrait> Validity<E> {
    pub fn new(valid_to: E::Column) -> Self {
        Self {
            valid_from: None,
            valid_to,
        }
    }

    pub fn with_valid_from(mut self, valid_from: E::Column) -> Self {
        self.valid_from = Some(valid_from);
        self
    }

    pub fn valid_to(&self) -> E::Column {
        self.valid_to
    }

    pub fn valid_from(&self) -> Option<E::Column> {
        self.valid_from
    }

    /// Predicate for `mode` at instant `at`; `None` when nothing is filtered.
    pub fn condition(&self, mode: QueryMode, at: DateTime<Utc>) -> Option<Condition> {
        match mode {
            QueryMode::All => None,
            QueryMode::Valid => {
                let mut condition = Condition::all();
                if let Some(valid_from) = self.valid_from {
                    condition = condition.add(
                        Condition::any()
                            .add(valid_from.is_null())
                            .add(valid_from.lte(at)),
                    );
                }
                Some(
                    condition.add(
                        Condition::any()
                            .add(self.valid_to.is_null())
                            .add(self.valid_to.gt(at)),
                    ),
                )
            }
            QueryMode::Removed => Some(
                Condition::all()
                    .add(self.valid_to.is_not_null())
                    .add(self.valid_to.lte(at)),
            ),
        }
    }

    /// In-memory counterpart of [`Validity::condition`] for `QueryMode::Valid`.
    pub fn is_valid(&self, model: &E::Model, at: DateTime<Utc>) -> bool {
        let starts_in_time = self
            .valid_from
            .and_then(|column| timestamp(model.get(column)))
            .map_or(true, |from| from <= at);
        let ends_after = timestamp(model.get(self.valid_to)).map_or(true, |to| to > at);
        starts_in_time && ends_after
    }
}

fn timestamp(value: Value) -> Option<DateTime<Utc>> {
    <DateTime<Utc> as ValueType>::try_from(value).ok()
}

/// Adds an optional condition to a base condition.
pub(crate) fn with_optional(base: Condition, extra: Option<Condition>) -> Condition {
    match extra {
        Some(extra) => base.add(extra),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use sea_orm::entity::prelude::*;

    use super::*;

    mod stamp {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
        #[sea_orm(table_name = "stamps")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub valid_from: Option<DateTimeUtc>,
            pub valid_to: Option<DateTimeUtc>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    fn model(valid_from: Option<DateTimeUtc>, valid_to: Option<DateTimeUtc>) -> stamp::Model {
        stamp::Model {
            id: 1,
            valid_from,
            valid_to,
        }
    }

    fn validity() -> Validity<stamp::Entity> {
        Validity::new(stamp::Column::ValidTo).with_valid_from(stamp::Column::ValidFrom)
    }

    #[test]
    fn unbounded_window_is_valid() {
        assert!(validity().is_valid(&model(None, None), Utc::now()));
    }

    #[test]
    fn valid_to_is_exclusive() {
        let now = Utc::now();
        let validity = validity();

        assert!(!validity.is_valid(&model(None, Some(now)), now));
        assert!(validity.is_valid(&model(None, Some(now + Duration::seconds(1))), now));
        assert!(!validity.is_valid(&model(None, Some(now - Duration::seconds(1))), now));
    }

    #[test]
    fn valid_from_is_inclusive() {
        let now = Utc::now();
        let validity = validity();

        assert!(validity.is_valid(&model(Some(now), None), now));
        assert!(!validity.is_valid(&model(Some(now + Duration::seconds(1)), None), now));
    }

    #[test]
    fn valid_from_is_ignored_when_not_configured() {
        let now = Utc::now();
        let validity = Validity::<stamp::Entity>::new(stamp::Column::ValidTo);

        assert!(validity.is_valid(&model(Some(now + Duration::days(1)), None), now));
    }

    #[test]
    fn unfiltered_mode_has_no_condition() {
        assert!(validity().condition(QueryMode::All, Utc::now()).is_none());
        assert!(validity().condition(QueryMode::Valid, Utc::now()).is_some());
        assert!(validity().condition(QueryMode::Removed, Utc::now()).is_some());
    }

    #[test]
    fn null_criteria_render_as_is_null() {
        use sea_orm::{DbBackend, QueryFilter, QueryTrait};

        let criteria = Criteria::<stamp::Entity>::new()
            .eq(stamp::Column::Id, 3)
            .eq(stamp::Column::ValidTo, Option::<DateTimeUtc>::None);
        let sql = stamp::Entity::find()
            .filter(criteria.condition())
            .build(DbBackend::Sqlite)
            .to_string();

        assert!(sql.contains(r#""stamps"."id" = 3"#), "{sql}");
        assert!(sql.contains(r#""stamps"."valid_to" IS NULL"#), "{sql}");
    }
}
