//! Historicization: removal stamps a validity end instead of deleting.
//!
//! [`TemporalTree`] wraps an engine implementing [`Historicize`] and routes
//! `remove`/`remove_all` to it; every other operation keeps the engine's own
//! index arithmetic and reads through its validity filter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, EntityTrait};

use crate::engine::{Position, TreeEngine};
use crate::error::TreeError;
use crate::query::{Criteria, QueryMode, Validity};
use crate::traits::TreeNode;

/// Engine hooks needed by [`TemporalTree`].
#[async_trait]
pub trait Historicize<M: TreeNode>: TreeEngine<M> {
    /// Entity whose rows carry the validity window.
    type Carrier: EntityTrait;

    fn install_validity(&mut self, validity: Validity<Self::Carrier>);

    async fn roots_in<C>(&self, conn: &C, mode: QueryMode) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait;

    async fn find_in<C>(
        &self,
        conn: &C,
        parent: Option<&M>,
        criteria: &Criteria<M::Entity>,
        mode: QueryMode,
    ) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait;

    async fn tree_cacheable_in<C>(
        &self,
        conn: &C,
        parent: &M,
        mode: QueryMode,
    ) -> Result<Self::CachedTree, TreeError>
    where
        C: ConnectionTrait;

    /// Children of the head of an unfiltered tree that are valid at `at`.
    fn valid_direct_children(&self, tree: &Self::CachedTree, at: DateTime<Utc>) -> Vec<M>;

    /// End the validity of the subtree of `node` at `at`.
    async fn historicize<C>(&self, conn: &C, node: &M, at: DateTime<Utc>) -> Result<(), TreeError>
    where
        C: ConnectionTrait;

    async fn unremove<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait;

    async fn historicize_all<C>(&self, conn: &C, at: DateTime<Utc>) -> Result<(), TreeError>
    where
        C: ConnectionTrait;

    /// Delete the subtree of `node` regardless of validity.
    async fn remove_physically<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait;

    /// Historicized nodes below `root` closest to it; removing these
    /// physically removes every historicized node they contain.
    async fn historicized_tops<C>(&self, conn: &C, root: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait;
}

/// Temporal decorator over a nested-sets or closure-table engine.
///
/// ```ignore
/// let tree = TemporalTree::new(
///     NestedSetsTree::<folder::Model>::new(),
///     Validity::new(folder::Column::ValidTo).with_valid_from(folder::Column::ValidFrom),
/// );
/// tree.remove(&db, &node).await?; // historicized, still counted by full_tree_cacheable
/// ```
pub struct TemporalTree<E> {
    inner: E,
}

impl<E> TemporalTree<E> {
    pub fn new<M>(mut engine: E, validity: Validity<<E as Historicize<M>>::Carrier>) -> Self
    where
        M: TreeNode,
        E: Historicize<M>,
    {
        engine.install_validity(validity);
        Self { inner: engine }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Historicized nodes matching `criteria`, restricted to the subtree of `parent` when given.
    pub async fn find_removed<M, C>(
        &self,
        conn: &C,
        parent: Option<&M>,
        criteria: &Criteria<M::Entity>,
    ) -> Result<Vec<M>, TreeError>
    where
        M: TreeNode,
        E: Historicize<M>,
        C: ConnectionTrait,
    {
        self.inner.find_in(conn, parent, criteria, QueryMode::Removed).await
    }

    /// Roots regardless of validity.
    pub async fn all_roots<M, C>(&self, conn: &C) -> Result<Vec<M>, TreeError>
    where
        M: TreeNode,
        E: Historicize<M>,
        C: ConnectionTrait,
    {
        self.inner.roots_in(conn, QueryMode::All).await
    }

    /// The subtree of `parent` including historicized members.
    pub async fn full_tree_cacheable<M, C>(
        &self,
        conn: &C,
        parent: &M,
    ) -> Result<<E as TreeEngine<M>>::CachedTree, TreeError>
    where
        M: TreeNode,
        E: Historicize<M>,
        C: ConnectionTrait,
    {
        self.inner.tree_cacheable_in(conn, parent, QueryMode::All).await
    }

    /// Direct children of the head of a full tree that are valid now.
    pub fn find_valid_direct_children<M>(&self, tree: &<E as TreeEngine<M>>::CachedTree) -> Vec<M>
    where
        M: TreeNode,
        E: Historicize<M>,
    {
        self.inner.valid_direct_children(tree, Utc::now())
    }

    /// Make a historicized subtree valid again.
    pub async fn unremove<M, C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        M: TreeNode,
        E: Historicize<M>,
        C: ConnectionTrait,
    {
        self.inner.unremove(conn, node).await
    }

    pub async fn remove_physically<M, C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        M: TreeNode,
        E: Historicize<M>,
        C: ConnectionTrait,
    {
        self.inner.remove_physically(conn, node).await
    }

    /// Reclaim every historicized subtree of every tree.
    pub async fn remove_historicized_trees_physically<M, C>(&self, conn: &C) -> Result<(), TreeError>
    where
        M: TreeNode,
        E: Historicize<M>,
        C: ConnectionTrait,
    {
        let mut removed = 0usize;
        for root in self.inner.roots_in(conn, QueryMode::All).await? {
            loop {
                let tops = self.inner.historicized_tops(conn, &root).await?;
                if tops.is_empty() {
                    break;
                }
                for top in &tops {
                    self.inner.remove_physically(conn, top).await?;
                }
                removed += tops.len();
            }
        }
        tracing::info!(removed, "removed historicized subtrees physically");
        Ok(())
    }

    pub async fn remove_all_physically<M, C>(&self, conn: &C) -> Result<(), TreeError>
    where
        M: TreeNode,
        E: Historicize<M>,
        C: ConnectionTrait,
    {
        let roots = self.inner.roots_in(conn, QueryMode::All).await?;
        for root in &roots {
            self.inner.remove_physically(conn, root).await?;
        }
        tracing::info!(trees = roots.len(), "removed all trees physically");
        Ok(())
    }
}

#[async_trait]
impl<M, E> TreeEngine<M> for TemporalTree<E>
where
    M: TreeNode,
    E: Historicize<M>,
{
    type CachedTree = E::CachedTree;

    async fn find<C>(&self, conn: &C, id: M::Id) -> Result<Option<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.find(conn, id).await
    }

    async fn find_by<C>(
        &self,
        conn: &C,
        parent: Option<&M>,
        criteria: &Criteria<M::Entity>,
    ) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.find_by(conn, parent, criteria).await
    }

    async fn is_root<C>(&self, conn: &C, node: &M) -> Result<bool, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.is_root(conn, node).await
    }

    async fn create_root<C>(&self, conn: &C, root: M::ActiveModel) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.create_root(conn, root).await
    }

    async fn roots<C>(&self, conn: &C) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.roots(conn).await
    }

    async fn size<C>(&self, conn: &C, node: &M) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.size(conn, node).await
    }

    async fn tree<C>(&self, conn: &C, parent: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.tree(conn, parent).await
    }

    async fn tree_cacheable<C>(&self, conn: &C, parent: &M) -> Result<E::CachedTree, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.tree_cacheable(conn, parent).await
    }

    fn find_sub_tree(&self, parent: &M, tree: &E::CachedTree) -> Result<E::CachedTree, TreeError> {
        self.inner.find_sub_tree(parent, tree)
    }

    fn find_direct_children(&self, tree: &E::CachedTree) -> Vec<M> {
        self.inner.find_direct_children(tree)
    }

    async fn children<C>(&self, conn: &C, parent: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.children(conn, parent).await
    }

    async fn child_count<C>(&self, conn: &C, parent: &M) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.child_count(conn, parent).await
    }

    async fn is_leaf<C>(&self, conn: &C, node: &M) -> Result<bool, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.is_leaf(conn, node).await
    }

    async fn parent<C>(&self, conn: &C, node: &M) -> Result<Option<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.parent(conn, node).await
    }

    async fn root<C>(&self, conn: &C, node: &M) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.root(conn, node).await
    }

    async fn path<C>(&self, conn: &C, node: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.path(conn, node).await
    }

    async fn level<C>(&self, conn: &C, node: &M) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.level(conn, node).await
    }

    async fn is_child_of<C>(&self, conn: &C, child: &M, parent: &M) -> Result<bool, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.is_child_of(conn, child, parent).await
    }

    async fn add_child_at<C>(
        &self,
        conn: &C,
        parent: &M,
        child: M::ActiveModel,
        position: Position,
    ) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.add_child_at(conn, parent, child, position).await
    }

    async fn add_child_before<C>(
        &self,
        conn: &C,
        sibling: &M,
        child: M::ActiveModel,
    ) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.add_child_before(conn, sibling, child).await
    }

    async fn remove<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.historicize(conn, node, Utc::now()).await
    }

    async fn move_to<C>(&self, conn: &C, node: &M, parent: &M, position: Position) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.move_to(conn, node, parent, position).await
    }

    async fn move_before<C>(&self, conn: &C, node: &M, sibling: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.move_before(conn, node, sibling).await
    }

    async fn move_to_be_root<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.move_to_be_root(conn, node).await
    }

    async fn copy_to<C>(
        &self,
        conn: &C,
        node: &M,
        parent: &M,
        position: Position,
        template: Option<M::ActiveModel>,
    ) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.copy_to(conn, node, parent, position, template).await
    }

    async fn copy_before<C>(
        &self,
        conn: &C,
        node: &M,
        sibling: &M,
        template: Option<M::ActiveModel>,
    ) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.copy_before(conn, node, sibling, template).await
    }

    async fn copy_to_be_root<C>(
        &self,
        conn: &C,
        node: &M,
        template: Option<M::ActiveModel>,
    ) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.copy_to_be_root(conn, node, template).await
    }

    async fn update<C>(&self, conn: &C, node: M::ActiveModel) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.update(conn, node).await
    }

    async fn check_unique_constraint<C>(
        &self,
        conn: &C,
        clone: &M::ActiveModel,
        root: Option<&M>,
        original: Option<&M>,
    ) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner
            .check_unique_constraint(conn, clone, root, original)
            .await
    }

    async fn remove_all<C>(&self, conn: &C) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        self.inner.historicize_all(conn, Utc::now()).await
    }
}
