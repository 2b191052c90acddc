use async_trait::async_trait;
use sea_orm::ConnectionTrait;

use crate::error::TreeError;
use crate::query::Criteria;
use crate::traits::TreeNode;

/// Target position inside a child list.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Position {
    /// 0-based index; indices past the end append.
    At(usize),
    /// End of the child list.
    #[default]
    Append,
}

impl Position {
    pub fn index(self) -> Option<usize> {
        match self {
            Position::At(index) => Some(index),
            Position::Append => None,
        }
    }
}

/// Hook run on every freshly cloned node of a copy before it is checked and saved.
pub type CopiedNodeRenamer<M> = Box<dyn Fn(&mut <M as TreeNode>::ActiveModel) + Send + Sync>;

/// Operations shared by the nested-sets and closure-table engines.
///
/// Every method takes the connection (or transaction) to run on; the caller
/// owns the transaction boundary. Structural mutations are serialized per
/// engine instance, reads are not.
#[async_trait]
pub trait TreeEngine<M: TreeNode>: Send + Sync {
    /// Materialized subtree returned by [`TreeEngine::tree_cacheable`].
    type CachedTree: Send + Sync;

    fn is_persistent(&self, node: &M::ActiveModel) -> bool {
        M::active_id(node).is_some()
    }

    async fn find<C>(&self, conn: &C, id: M::Id) -> Result<Option<M>, TreeError>
    where
        C: ConnectionTrait;

    /// Nodes matching `criteria`, restricted to the subtree of `parent` when given.
    async fn find_by<C>(
        &self,
        conn: &C,
        parent: Option<&M>,
        criteria: &Criteria<M::Entity>,
    ) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait;

    async fn is_root<C>(&self, conn: &C, node: &M) -> Result<bool, TreeError>
    where
        C: ConnectionTrait;

    async fn create_root<C>(&self, conn: &C, root: M::ActiveModel) -> Result<M, TreeError>
    where
        C: ConnectionTrait;

    async fn roots<C>(&self, conn: &C) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait;

    /// Number of nodes in the subtree of `node`, the node included.
    async fn size<C>(&self, conn: &C, node: &M) -> Result<u64, TreeError>
    where
        C: ConnectionTrait;

    /// The subtree of `parent`, the parent included.
    async fn tree<C>(&self, conn: &C, parent: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait;

    /// The subtree of `parent` in depth-first order, usable with
    /// [`TreeEngine::find_sub_tree`] and [`TreeEngine::find_direct_children`].
    async fn tree_cacheable<C>(&self, conn: &C, parent: &M) -> Result<Self::CachedTree, TreeError>
    where
        C: ConnectionTrait;

    /// Extract the subtree of `parent` from a previously fetched tree without querying.
    fn find_sub_tree(&self, parent: &M, tree: &Self::CachedTree) -> Result<Self::CachedTree, TreeError>;

    /// Direct children of the first node of a previously fetched tree, without querying.
    fn find_direct_children(&self, tree: &Self::CachedTree) -> Vec<M>;

    async fn children<C>(&self, conn: &C, parent: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait;

    async fn child_count<C>(&self, conn: &C, parent: &M) -> Result<u64, TreeError>
    where
        C: ConnectionTrait;

    async fn is_leaf<C>(&self, conn: &C, node: &M) -> Result<bool, TreeError>
    where
        C: ConnectionTrait;

    async fn parent<C>(&self, conn: &C, node: &M) -> Result<Option<M>, TreeError>
    where
        C: ConnectionTrait;

    /// Root of the tree containing `node`; a root is its own root.
    async fn root<C>(&self, conn: &C, node: &M) -> Result<M, TreeError>
    where
        C: ConnectionTrait;

    /// Ancestors of `node`, root first, the node excluded.
    async fn path<C>(&self, conn: &C, node: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait;

    /// Depth of `node`; roots are at level 0.
    async fn level<C>(&self, conn: &C, node: &M) -> Result<u64, TreeError>
    where
        C: ConnectionTrait;

    /// Whether `child` is a strict descendant of `parent`.
    async fn is_child_of<C>(&self, conn: &C, child: &M, parent: &M) -> Result<bool, TreeError>
    where
        C: ConnectionTrait;

    async fn is_equal_to_or_child_of<C>(
        &self,
        conn: &C,
        child: &M,
        parent: &M,
    ) -> Result<bool, TreeError>
    where
        C: ConnectionTrait,
    {
        if child.id() == parent.id() {
            return Ok(true);
        }
        self.is_child_of(conn, child, parent).await
    }

    /// Append `child` to the children of `parent`.
    async fn add_child<C>(&self, conn: &C, parent: &M, child: M::ActiveModel) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        self.add_child_at(conn, parent, child, Position::Append).await
    }

    async fn add_child_at<C>(
        &self,
        conn: &C,
        parent: &M,
        child: M::ActiveModel,
        position: Position,
    ) -> Result<M, TreeError>
    where
        C: ConnectionTrait;

    /// Insert `child` at the current position of `sibling`, pushing it one slot back.
    async fn add_child_before<C>(
        &self,
        conn: &C,
        sibling: &M,
        child: M::ActiveModel,
    ) -> Result<M, TreeError>
    where
        C: ConnectionTrait;

    /// Remove `node` and its whole subtree.
    async fn remove<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait;

    async fn move_node<C>(&self, conn: &C, node: &M, parent: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        self.move_to(conn, node, parent, Position::Append).await
    }

    async fn move_to<C>(&self, conn: &C, node: &M, parent: &M, position: Position) -> Result<(), TreeError>
    where
        C: ConnectionTrait;

    /// Move `node` to the current position of `sibling`; moving a node before
    /// itself does nothing.
    async fn move_before<C>(&self, conn: &C, node: &M, sibling: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait;

    /// Detach `node` with its subtree into a tree of its own; a no-op for roots.
    async fn move_to_be_root<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait;

    async fn copy_node<C>(
        &self,
        conn: &C,
        node: &M,
        parent: &M,
        template: Option<M::ActiveModel>,
    ) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        self.copy_to(conn, node, parent, Position::Append, template).await
    }

    /// Copy the subtree of `node` below `parent`; `template` replaces the clone
    /// of `node` itself when given. Returns the copied top node.
    async fn copy_to<C>(
        &self,
        conn: &C,
        node: &M,
        parent: &M,
        position: Position,
        template: Option<M::ActiveModel>,
    ) -> Result<M, TreeError>
    where
        C: ConnectionTrait;

    async fn copy_before<C>(
        &self,
        conn: &C,
        node: &M,
        sibling: &M,
        template: Option<M::ActiveModel>,
    ) -> Result<M, TreeError>
    where
        C: ConnectionTrait;

    async fn copy_to_be_root<C>(
        &self,
        conn: &C,
        node: &M,
        template: Option<M::ActiveModel>,
    ) -> Result<M, TreeError>
    where
        C: ConnectionTrait;

    /// Persist changed properties of a persistent node.
    async fn update<C>(&self, conn: &C, node: M::ActiveModel) -> Result<M, TreeError>
    where
        C: ConnectionTrait;

    /// Check an unsaved clone carrying new property values before the real
    /// node is changed. `original` is the node the clone stands for.
    async fn check_unique_constraint<C>(
        &self,
        conn: &C,
        clone: &M::ActiveModel,
        root: Option<&M>,
        original: Option<&M>,
    ) -> Result<(), TreeError>
    where
        C: ConnectionTrait;

    async fn remove_all<C>(&self, conn: &C) -> Result<(), TreeError>
    where
        C: ConnectionTrait;
}
