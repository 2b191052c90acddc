use std::borrow::Cow;

use async_trait::async_trait;
use sea_orm::{ColumnTrait, Condition, ConnectionTrait, IdenStatic, IntoActiveModel};

use crate::engine::TreeEngine;
use crate::error::{TreeError, UniqueViolation};
use crate::location::{Action, Location, Relation};
use crate::query::is_null;
use crate::traits::{active_value, model_value, Column, TreeNode};

/// Which nodes a candidate must differ from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UniqueScope {
    /// Every other node of the destination tree.
    WholeTree,
    /// The direct siblings at the destination; root-level checks fall back to
    /// [`UniqueScope::WholeTree`].
    Children,
}

/// Counting queries a [`UniqueConstraint`] needs from an engine, on top of the
/// read operations of [`TreeEngine`].
#[async_trait]
pub trait UniquenessScope<M: TreeNode>: TreeEngine<M> {
    /// Valid nodes of the tree rooted at `root` matching `condition`.
    async fn count_in_tree<C>(&self, conn: &C, root: &M, condition: Condition) -> Result<u64, TreeError>
    where
        C: ConnectionTrait;

    /// Valid roots matching `condition`.
    async fn count_among_roots<C>(&self, conn: &C, condition: Condition) -> Result<u64, TreeError>
    where
        C: ConnectionTrait;
}

/// Uniqueness policy evaluated before every structural mutation.
///
/// Each property set is a tuple of columns whose combined value must be
/// unique; a candidate violates the constraint when it equals another node on
/// every column of any one set.
#[derive(Clone, Debug)]
pub struct UniqueConstraint<M: TreeNode> {
    scope: UniqueScope,
    property_sets: Vec<Vec<Column<M>>>,
    check_roots: bool,
}

impl<M: TreeNode> UniqueConstraint<M> {
    pub fn new<S, P>(scope: UniqueScope, property_sets: S, check_roots: bool) -> Result<Self, TreeError>
    where
        S: IntoIterator<Item = P>,
        P: IntoIterator<Item = Column<M>>,
    {
        let property_sets: Vec<Vec<Column<M>>> = property_sets
            .into_iter()
            .map(|set| set.into_iter().collect())
            .collect();

        if property_sets.is_empty() {
            return Err(TreeError::configuration(
                "unique constraint needs at least one property set",
            ));
        }
        if property_sets.iter().any(Vec::is_empty) {
            return Err(TreeError::configuration("unique property sets must not be empty"));
        }

        Ok(Self {
            scope,
            property_sets,
            check_roots,
        })
    }

    pub fn whole_tree<S, P>(property_sets: S, check_roots: bool) -> Result<Self, TreeError>
    where
        S: IntoIterator<Item = P>,
        P: IntoIterator<Item = Column<M>>,
    {
        Self::new(UniqueScope::WholeTree, property_sets, check_roots)
    }

    pub fn children<S, P>(property_sets: S, check_roots: bool) -> Result<Self, TreeError>
    where
        S: IntoIterator<Item = P>,
        P: IntoIterator<Item = Column<M>>,
    {
        Self::new(UniqueScope::Children, property_sets, check_roots)
    }

    pub fn scope(&self) -> UniqueScope {
        self.scope
    }

    pub fn property_sets(&self) -> &[Vec<Column<M>>] {
        &self.property_sets
    }

    /// Whether roots must be mutually unique too.
    pub fn check_roots(&self) -> bool {
        self.check_roots
    }

    /// Check `candidates` (unmodified clones, the top node first) against the
    /// destination described by `location`.
    pub async fn check<E, C>(
        &self,
        engine: &E,
        conn: &C,
        candidates: &[M::ActiveModel],
        location: &Location<M>,
    ) -> Result<(), TreeError>
    where
        E: UniquenessScope<M> + ?Sized,
        C: ConnectionTrait,
    {
        let Some(first) = candidates.first() else {
            return Ok(());
        };

        match self.scope {
            UniqueScope::Children if !location.is_root_check(identity::<M>(first, location).as_ref()) => {
                self.check_children(engine, conn, candidates, location).await
            }
            _ => self.check_whole_tree(engine, conn, candidates, location).await,
        }
    }

    async fn check_whole_tree<E, C>(
        &self,
        engine: &E,
        conn: &C,
        candidates: &[M::ActiveModel],
        location: &Location<M>,
    ) -> Result<(), TreeError>
    where
        E: UniquenessScope<M> + ?Sized,
        C: ConnectionTrait,
    {
        let nodes = self.nodes_to_check(engine, conn, candidates, location).await?;

        for node in nodes.iter() {
            let identity = identity::<M>(node, location);
            let roots_check = location.is_root_check(identity.as_ref());
            if roots_check && !self.check_roots {
                continue;
            }

            let mut condition = Condition::all().add(self.matching_condition(node));
            if matches!(location.action(), Action::Update | Action::Move) {
                if let Some(id) = identity {
                    condition = condition.add(M::id_column().ne(id));
                }
            }

            let count = match location.root() {
                Some(root) if !roots_check => engine.count_in_tree(conn, root, condition).await?,
                _ => engine.count_among_roots(conn, condition).await?,
            };
            if count > 0 {
                return Err(self.violation(node));
            }
            if roots_check {
                break;
            }
        }
        Ok(())
    }

    /// Moving within one tree needs no check; moving into another tree
    /// re-validates the whole moved subtree against the destination.
    async fn nodes_to_check<'a, E, C>(
        &self,
        engine: &E,
        conn: &C,
        candidates: &'a [M::ActiveModel],
        location: &Location<M>,
    ) -> Result<Cow<'a, [M::ActiveModel]>, TreeError>
    where
        E: UniquenessScope<M> + ?Sized,
        C: ConnectionTrait,
    {
        if location.action() != Action::Move {
            return Ok(Cow::Borrowed(candidates));
        }
        let Some(moving_id) = candidates.first().and_then(M::active_id) else {
            return Ok(Cow::Borrowed(candidates));
        };
        if location.is_root_check(Some(&moving_id)) {
            return Ok(Cow::Borrowed(candidates));
        }

        let moving = engine
            .find(conn, moving_id)
            .await?
            .ok_or_else(|| TreeError::precondition("moving node is not persistent"))?;
        let source_root = engine.root(conn, &moving).await?;
        if location.root().map(TreeNode::id) == Some(source_root.id()) {
            return Ok(Cow::Owned(Vec::new()));
        }

        let subtree = engine.tree(conn, &moving).await?;
        Ok(Cow::Owned(
            subtree
                .into_iter()
                .map(IntoActiveModel::<M::ActiveModel>::into_active_model)
                .collect(),
        ))
    }

    async fn check_children<E, C>(
        &self,
        engine: &E,
        conn: &C,
        candidates: &[M::ActiveModel],
        location: &Location<M>,
    ) -> Result<(), TreeError>
    where
        E: UniquenessScope<M> + ?Sized,
        C: ConnectionTrait,
    {
        let parent = match (location.relation(), location.related()) {
            (Some(Relation::Parent), Some(parent)) => Some(parent.clone()),
            (_, Some(related)) => engine.parent(conn, related).await?,
            (_, None) => None,
        };
        let Some(parent) = parent else {
            return self.check_whole_tree(engine, conn, candidates, location).await;
        };

        let candidate = &candidates[0];
        let excluded = match location.action() {
            Action::Move | Action::Update => identity::<M>(candidate, location),
            Action::Insert | Action::Copy => None,
        };

        for sibling in engine.children(conn, &parent).await? {
            if excluded.as_ref() == Some(&sibling.id()) {
                continue;
            }
            let collides = self.property_sets.iter().any(|set| {
                set.iter().all(|column| {
                    let existing = model_value(&sibling, *column);
                    match active_value::<M>(candidate, *column) {
                        Some(value) => !is_null(&value) && !is_null(&existing) && value == existing,
                        None => false,
                    }
                })
            });
            if collides {
                return Err(self.violation(candidate));
            }
        }
        Ok(())
    }

    fn matching_condition(&self, node: &M::ActiveModel) -> Condition {
        self.property_sets
            .iter()
            .fold(Condition::any(), |any, set| {
                let all = set.iter().fold(Condition::all(), |all, column| {
                    match active_value::<M>(node, *column) {
                        Some(value) if !is_null(&value) => all.add(column.eq(value)),
                        _ => all.add(column.is_null()),
                    }
                });
                any.add(all)
            })
    }

    fn violation(&self, candidate: &M::ActiveModel) -> TreeError {
        let mut values = Vec::new();
        for column in self.property_sets.iter().flatten() {
            let name = column.as_str().to_owned();
            if values.iter().any(|(existing, _)| existing == &name) {
                continue;
            }
            if let Some(value) = active_value::<M>(candidate, *column) {
                values.push((name, value));
            }
        }
        tracing::debug!(entity = M::tree_config().entity_name(), ?values, "unique constraint violated");
        TreeError::UniquenessViolation(UniqueViolation::new(
            M::tree_config().entity_name(),
            values,
            candidate.clone(),
        ))
    }
}

/// The identity a candidate stands for: its own key, or the existing node an
/// update clone replaces.
fn identity<M: TreeNode>(candidate: &M::ActiveModel, location: &Location<M>) -> Option<M::Id> {
    M::active_id(candidate).or_else(|| location.existing_id())
}
