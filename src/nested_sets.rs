//! Nested-sets engine: every node owns the interval `[left, right]` of its
//! tree (identified by `top_level`), descendants nest strictly inside it and
//! depth-first order is ascending `left`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Select,
};

use crate::config::{TreeConfig, TreeOptions};
use crate::engine::{CopiedNodeRenamer, Position, TreeEngine};
use crate::error::TreeError;
use crate::location::{Action, Location, Relation};
use crate::lock::MutationLock;
use crate::query::{with_optional, Criteria, QueryMode, Validity};
use crate::temporal::Historicize;
use crate::traits::{NestedSetsNode, TreeNode};
use crate::uniqueness::{UniqueConstraint, UniquenessScope};

/// `left` of every root.
pub const ROOT_LEFT: i32 = 1;

/// Tree engine storing `(left, right, top_level)` on the node rows.
///
/// The `top_level` column must be nullable: a root is inserted first and
/// pointed at itself once its identity is known.
pub struct NestedSetsTree<M: NestedSetsNode> {
    config: TreeConfig,
    unique: Option<UniqueConstraint<M>>,
    renamer: Option<CopiedNodeRenamer<M>>,
    validity: Option<Validity<M::Entity>>,
    lock: MutationLock,
}

impl<M: NestedSetsNode> Default for NestedSetsTree<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: NestedSetsNode> NestedSetsTree<M> {
    pub fn new() -> Self {
        let config = M::tree_config().clone();
        let lock = MutationLock::new(config.advisory_lock_strategy().clone());
        Self {
            config,
            unique: None,
            renamer: None,
            validity: None,
            lock,
        }
    }

    pub fn with_options(mut self, options: TreeOptions) -> Self {
        self.config = options.apply(self.config);
        self.lock = MutationLock::new(self.config.advisory_lock_strategy().clone());
        self
    }

    pub fn with_unique_constraint(mut self, constraint: UniqueConstraint<M>) -> Self {
        self.unique = Some(constraint);
        self
    }

    /// Hook applied to every clone produced by a copy, before checking and saving it.
    pub fn with_copied_node_renamer<F>(mut self, renamer: F) -> Self
    where
        F: Fn(&mut M::ActiveModel) + Send + Sync + 'static,
    {
        self.renamer = Some(Box::new(renamer));
        self
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn unique_constraint(&self) -> Option<&UniqueConstraint<M>> {
        self.unique.as_ref()
    }

    fn is_temporal(&self) -> bool {
        self.validity.is_some()
    }

    fn select(&self, condition: Condition, mode: QueryMode) -> Select<M::Entity> {
        let validity = self
            .validity
            .as_ref()
            .and_then(|validity| validity.condition(mode, Utc::now()));
        M::Entity::find().filter(with_optional(condition, validity))
    }

    async fn find_impl<C: ConnectionTrait>(&self, conn: &C, id: M::Id) -> Result<Option<M>, TreeError> {
        let node = M::Entity::find()
            .filter(M::id_column().eq(id))
            .one(conn)
            .await?;
        Ok(node)
    }

    /// Current state of `node`; bulk index updates bypass caller copies.
    async fn reload<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<M, TreeError> {
        self.find_impl(conn, node.id()).await?.ok_or_else(|| {
            TreeError::precondition(format!(
                "{} {:?} is not persistent",
                self.config.entity_name(),
                node.id()
            ))
        })
    }

    async fn root_impl<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<M, TreeError> {
        let top = top_of(node)?;
        if top == node.id() {
            return Ok(node.clone());
        }
        self.find_impl(conn, top.clone())
            .await?
            .ok_or_else(|| TreeError::corruption(format!("root {top:?} of {:?} does not exist", node.id())))
    }

    async fn tree_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: &M,
        mode: QueryMode,
    ) -> Result<Vec<M>, TreeError> {
        let nodes = self
            .select(subtree_condition(parent)?, mode)
            .order_by_asc(M::left_column())
            .all(conn)
            .await?;
        Ok(nodes)
    }

    async fn select_nodes<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: Option<&M>,
        criteria: &Criteria<M::Entity>,
        mode: QueryMode,
    ) -> Result<Vec<M>, TreeError> {
        let mut condition = criteria.condition();
        if let Some(parent) = parent {
            let parent = self.reload(conn, parent).await?;
            condition = condition.add(subtree_condition(&parent)?);
        }
        let nodes = self
            .select(condition, mode)
            .order_by_asc(M::top_level_column())
            .order_by_asc(M::left_column())
            .all(conn)
            .await?;
        Ok(nodes)
    }

    async fn select_roots<C: ConnectionTrait>(&self, conn: &C, mode: QueryMode) -> Result<Vec<M>, TreeError> {
        let roots = self
            .select(root_condition::<M>(), mode)
            .order_by_asc(M::id_column())
            .all(conn)
            .await?;
        Ok(roots)
    }

    async fn is_leaf_impl<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<bool, TreeError> {
        if node.left() + 1 == node.right() {
            return Ok(true);
        }
        if !self.is_temporal() {
            return Ok(false);
        }
        // historicized descendants keep their index space
        Ok(self.tree_in(conn, node, QueryMode::Valid).await?.len() <= 1)
    }

    async fn children_impl<C: ConnectionTrait>(&self, conn: &C, parent: &M) -> Result<Vec<M>, TreeError> {
        match &self.validity {
            Some(validity) => {
                let tree = self.tree_in(conn, parent, QueryMode::All).await?;
                let now = Utc::now();
                Ok(direct_children(&tree, true, |node| validity.is_valid(node, now)))
            }
            None => {
                let tree = self.tree_in(conn, parent, QueryMode::All).await?;
                Ok(direct_children(&tree, false, |_| true))
            }
        }
    }

    /// Children positions count historicized siblings too.
    async fn child_list_for_insertion<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: &M,
    ) -> Result<Vec<M>, TreeError> {
        let tree = self.tree_in(conn, parent, QueryMode::All).await?;
        Ok(direct_children(&tree, self.is_temporal(), |_| true))
    }

    async fn path_impl<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<Vec<M>, TreeError> {
        let path = M::Entity::find()
            .filter(ancestors_condition(node)?)
            .order_by_asc(M::left_column())
            .all(conn)
            .await?;
        Ok(path)
    }

    /// Where a node lands below `parent` at `position`.
    async fn resolve_target<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: &M,
        position: Position,
        moving: Option<&M>,
        action: Action,
    ) -> Result<(i32, Location<M>), TreeError> {
        let root = self.root_impl(conn, parent).await?;

        if self.is_leaf_impl(conn, parent).await? {
            // there could be historicized children, insert at head
            return Ok((parent.left() + 1, Location::under(Some(root), parent.clone(), action)));
        }

        let append = |root: M| Ok((parent.right(), Location::under(Some(root), parent.clone(), action)));
        let Some(index) = position.index() else {
            return append(root);
        };

        let children = self.child_list_for_insertion(conn, parent).await?;
        let Some(mut sibling) = children.get(index) else {
            return append(root);
        };

        if let (Some(moving), Action::Move) = (moving, action) {
            let current = children.iter().position(|child| child.id() == moving.id());
            if matches!(current, Some(current) if current < index) {
                // the list closes up once the moving node leaves its slot
                match children.get(index + 1) {
                    Some(next) => sibling = next,
                    None => return append(root),
                }
            }
        }

        Ok((sibling.left(), Location::beside(Some(root), sibling.clone(), action)))
    }

    async fn sibling_target<C: ConnectionTrait>(
        &self,
        conn: &C,
        sibling: &M,
        action: Action,
    ) -> Result<(i32, Location<M>), TreeError> {
        let root = self.root_impl(conn, sibling).await?;
        if root.id() == sibling.id() {
            return Err(TreeError::precondition(format!(
                "sibling {:?} is a root",
                sibling.id()
            )));
        }
        Ok((sibling.left(), Location::beside(Some(root), sibling.clone(), action)))
    }

    /// Rejects targets inside the subtree of `node`.
    async fn copy_or_move_preconditions<C: ConnectionTrait>(
        &self,
        conn: &C,
        relative: &M,
        node: &M,
        allow_self: bool,
    ) -> Result<(), TreeError> {
        top_of(relative)?;
        top_of(node)?;
        let inside = if relative.id() == node.id() {
            !allow_self
        } else {
            self.is_child_of(conn, relative, node).await?
        };
        if inside {
            return Err(TreeError::precondition(format!(
                "target {:?} lies inside the subtree of {:?}",
                relative.id(),
                node.id()
            )));
        }
        Ok(())
    }

    async fn check_unique<C: ConnectionTrait>(
        &self,
        conn: &C,
        candidates: &[M::ActiveModel],
        location: &Location<M>,
    ) -> Result<(), TreeError> {
        match &self.unique {
            Some(unique) => unique.check(self, conn, candidates, location).await,
            None => Ok(()),
        }
    }

    /// Shift `left >= gap_left` and `right >= gap_right` of one tree by `delta`.
    async fn shift<C: ConnectionTrait>(
        &self,
        conn: &C,
        top: &M::Id,
        gap_left: i32,
        gap_right: i32,
        delta: i32,
    ) -> Result<(), TreeError> {
        let lefts = M::Entity::update_many()
            .col_expr(M::left_column(), Expr::col(M::left_column()).add(delta))
            .filter(M::top_level_column().eq(top.clone()))
            .filter(M::left_column().gte(gap_left))
            .exec(conn)
            .await?;
        let rights = M::Entity::update_many()
            .col_expr(M::right_column(), Expr::col(M::right_column()).add(delta))
            .filter(M::top_level_column().eq(top.clone()))
            .filter(M::right_column().gte(gap_right))
            .exec(conn)
            .await?;
        tracing::debug!(
            entity = self.config.entity_name(),
            ?top,
            gap_left,
            gap_right,
            delta,
            lefts = lefts.rows_affected,
            rights = rights.rows_affected,
            "shifted nested-sets indices"
        );
        Ok(())
    }

    async fn add_child_impl<C: ConnectionTrait>(
        &self,
        conn: &C,
        mut child: M::ActiveModel,
        target_left: i32,
        location: Location<M>,
    ) -> Result<M, TreeError> {
        if self.is_persistent(&child) {
            return Err(TreeError::precondition(
                "node is already persistent, it can not be added as child",
            ));
        }
        let top = location
            .root()
            .map(TreeNode::id)
            .ok_or_else(|| TreeError::precondition("child location has no root"))?;

        child.set(M::top_level_column(), Some(top.clone()).into());
        child.set(M::left_column(), target_left.into());
        child.set(M::right_column(), (target_left + 1).into());

        // before the gap, so a rejected insert leaves the tree untouched
        self.check_unique(conn, std::slice::from_ref(&child), &location).await?;
        self.shift(conn, &top, target_left, target_left, 2).await?;

        let saved = child.insert(conn).await?;
        tracing::debug!(entity = self.config.entity_name(), node = ?saved.id(), target_left, "added child");
        Ok(saved)
    }

    async fn move_impl<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
        target_left: i32,
        location: Location<M>,
    ) -> Result<(), TreeError> {
        let source_top = top_of(node)?;
        let target_top = location.root().map(TreeNode::id).unwrap_or_else(|| node.id());
        let same_tree = location.root().is_some() && target_top == source_top;

        let candidate = node.clone().into_active_model();
        self.check_unique(conn, std::slice::from_ref(&candidate), &location).await?;

        let count = subtree_size(node);
        let range = count * 2;
        if target_left > ROOT_LEFT {
            self.shift(conn, &target_top, target_left, target_left, range).await?;
        }

        let mut source_left = node.left();
        let mut source_right = node.right();
        let mut distance = target_left - source_left;
        if same_tree && distance < 0 {
            // the gap was opened in front of the source range and displaced it
            distance -= range;
            source_left += range;
            source_right += range;
        }

        let moved = M::Entity::update_many()
            .col_expr(M::left_column(), Expr::col(M::left_column()).add(distance))
            .col_expr(M::right_column(), Expr::col(M::right_column()).add(distance))
            .col_expr(M::top_level_column(), Expr::value(Some(target_top.clone())))
            .filter(M::top_level_column().eq(source_top.clone()))
            .filter(M::left_column().gte(source_left))
            .filter(M::right_column().lte(source_right))
            .exec(conn)
            .await?;
        tracing::debug!(
            entity = self.config.entity_name(),
            node = ?node.id(),
            distance,
            same_tree,
            moved = moved.rows_affected,
            "moved subtree"
        );

        let gap_left = source_left + range;
        self.shift(conn, &source_top, gap_left, gap_left, -range).await
    }

    async fn copy_impl<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
        target_left: i32,
        location: Location<M>,
        template: Option<M::ActiveModel>,
    ) -> Result<M, TreeError> {
        // historicized members are copied too, they occupy index space
        let tree = self.tree_in(conn, node, QueryMode::All).await?;
        let target_top = location.root().map(TreeNode::id);
        let distance = target_left - node.left();

        let mut template = template;
        let mut clones = Vec::with_capacity(tree.len());
        for original in &tree {
            let mut clone = match template.take() {
                Some(template) if clones.is_empty() => template,
                _ => original.clone_node(),
            };
            if let Some(renamer) = &self.renamer {
                renamer(&mut clone);
            }
            clone.set(M::left_column(), (original.left() + distance).into());
            clone.set(M::right_column(), (original.right() + distance).into());
            clone.set(M::top_level_column(), target_top.clone().into());
            clones.push(clone);
        }

        self.check_unique(conn, &clones, &location).await?;

        if let Some(top) = &target_top {
            if target_left > ROOT_LEFT {
                self.shift(conn, top, target_left, target_left, subtree_size(node) * 2)
                    .await?;
            }
        }

        let mut clones = clones.into_iter();
        let Some(first) = clones.next() else {
            return Err(TreeError::precondition("nothing to copy"));
        };
        let mut copied = first.insert(conn).await?;
        let top = match target_top {
            Some(top) => top,
            None => {
                M::Entity::update_many()
                    .col_expr(M::top_level_column(), Expr::value(Some(copied.id())))
                    .filter(M::id_column().eq(copied.id()))
                    .exec(conn)
                    .await?;
                copied = self.reload(conn, &copied).await?;
                copied.id()
            }
        };
        for mut clone in clones {
            clone.set(M::top_level_column(), Some(top.clone()).into());
            clone.insert(conn).await?;
        }

        tracing::debug!(
            entity = self.config.entity_name(),
            source = ?node.id(),
            copy = ?copied.id(),
            nodes = tree.len(),
            "copied subtree"
        );
        Ok(copied)
    }

    async fn remove_impl<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<(), TreeError> {
        let top = top_of(node)?;
        if top == node.id() {
            // detach members first, some databases enforce the self reference
            M::Entity::update_many()
                .col_expr(M::top_level_column(), Expr::value(Option::<M::Id>::None))
                .filter(M::top_level_column().eq(top.clone()))
                .exec(conn)
                .await?;
        }

        let removed = M::Entity::delete_many()
            .filter(
                Condition::any()
                    .add(M::top_level_column().is_null())
                    .add(M::top_level_column().eq(top.clone())),
            )
            .filter(M::left_column().gte(node.left()))
            .filter(M::right_column().lte(node.right()))
            .exec(conn)
            .await?;
        tracing::debug!(
            entity = self.config.entity_name(),
            node = ?node.id(),
            removed = removed.rows_affected,
            "removed subtree"
        );

        let range = subtree_size(node) * 2;
        self.shift(conn, &top, node.left(), node.right(), -range).await
    }

    async fn stamp_subtree<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
        valid_to: Option<DateTime<Utc>>,
    ) -> Result<u64, TreeError> {
        let validity = self
            .validity
            .as_ref()
            .ok_or_else(|| TreeError::configuration("engine has no validity columns"))?;
        // earlier removals inside the subtree keep their own end
        let still_valid = valid_to.and_then(|at| validity.condition(QueryMode::Valid, at));
        let stamped = M::Entity::update_many()
            .col_expr(validity.valid_to(), Expr::value(valid_to))
            .filter(with_optional(subtree_condition(node)?, still_valid))
            .exec(conn)
            .await?;
        Ok(stamped.rows_affected)
    }
}

#[async_trait]
impl<M: NestedSetsNode> TreeEngine<M> for NestedSetsTree<M> {
    type CachedTree = Vec<M>;

    async fn find<C>(&self, conn: &C, id: M::Id) -> Result<Option<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.find_impl(conn, id).await
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
        self.select_nodes(conn, parent, criteria, QueryMode::Valid).await
    }

    async fn is_root<C>(&self, conn: &C, node: &M) -> Result<bool, TreeError>
    where
        C: ConnectionTrait,
    {
        let node = self.reload(conn, node).await?;
        Ok(node.top_level() == Some(node.id()))
    }

    async fn create_root<C>(&self, conn: &C, mut root: M::ActiveModel) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        if self.is_persistent(&root) {
            return Err(TreeError::precondition("root is already persistent"));
        }

        root.set(M::left_column(), ROOT_LEFT.into());
        root.set(M::right_column(), (ROOT_LEFT + 1).into());
        root.set(M::top_level_column(), Option::<M::Id>::None.into());
        self.check_unique(conn, std::slice::from_ref(&root), &Location::root_level(Action::Insert))
            .await?;

        let saved = root.insert(conn).await?;
        M::Entity::update_many()
            .col_expr(M::top_level_column(), Expr::value(Some(saved.id())))
            .filter(M::id_column().eq(saved.id()))
            .exec(conn)
            .await?;
        tracing::debug!(entity = self.config.entity_name(), root = ?saved.id(), "created root");
        self.reload(conn, &saved).await
    }

    async fn roots<C>(&self, conn: &C) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.select_roots(conn, QueryMode::Valid).await
    }

    async fn size<C>(&self, conn: &C, node: &M) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        let node = self.reload(conn, node).await?;
        if self.is_temporal() {
            let tree = self.tree_in(conn, &node, QueryMode::Valid).await?;
            return Ok(tree.len() as u64);
        }
        Ok(subtree_size(&node) as u64)
    }

    async fn tree<C>(&self, conn: &C, parent: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        let parent = self.reload(conn, parent).await?;
        self.tree_in(conn, &parent, QueryMode::Valid).await
    }

    async fn tree_cacheable<C>(&self, conn: &C, parent: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.tree(conn, parent).await
    }

    fn find_sub_tree(&self, parent: &M, tree: &Vec<M>) -> Result<Vec<M>, TreeError> {
        let parent = tree
            .iter()
            .find(|node| node.id() == parent.id())
            .unwrap_or(parent);
        Ok(tree
            .iter()
            .filter(|node| node.left() >= parent.left() && node.right() <= parent.right())
            .cloned()
            .collect())
    }

    fn find_direct_children(&self, tree: &Vec<M>) -> Vec<M> {
        direct_children(tree, self.is_temporal(), |_| true)
    }

    async fn children<C>(&self, conn: &C, parent: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        let parent = self.reload(conn, parent).await?;
        self.children_impl(conn, &parent).await
    }

    async fn child_count<C>(&self, conn: &C, parent: &M) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        Ok(self.children(conn, parent).await?.len() as u64)
    }

    async fn is_leaf<C>(&self, conn: &C, node: &M) -> Result<bool, TreeError>
    where
        C: ConnectionTrait,
    {
        let node = self.reload(conn, node).await?;
        self.is_leaf_impl(conn, &node).await
    }

    async fn parent<C>(&self, conn: &C, node: &M) -> Result<Option<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        let node = self.reload(conn, node).await?;
        Ok(self.path_impl(conn, &node).await?.pop())
    }

    async fn root<C>(&self, conn: &C, node: &M) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        let node = self.reload(conn, node).await?;
        self.root_impl(conn, &node).await
    }

    async fn path<C>(&self, conn: &C, node: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        let node = self.reload(conn, node).await?;
        self.path_impl(conn, &node).await
    }

    async fn level<C>(&self, conn: &C, node: &M) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        let node = self.reload(conn, node).await?;
        let level = M::Entity::find()
            .filter(ancestors_condition(&node)?)
            .count(conn)
            .await?;
        Ok(level)
    }

    async fn is_child_of<C>(&self, conn: &C, child: &M, parent: &M) -> Result<bool, TreeError>
    where
        C: ConnectionTrait,
    {
        let child = self.reload(conn, child).await?;
        let parent = self.reload(conn, parent).await?;
        Ok(child.top_level().is_some()
            && child.top_level() == parent.top_level()
            && child.left() > parent.left()
            && child.right() < parent.right())
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
        let _guard = self.lock.acquire(conn).await?;
        let parent = self.reload(conn, parent).await?;
        let (target_left, location) = self
            .resolve_target(conn, &parent, position, None, Action::Insert)
            .await?;
        self.add_child_impl(conn, child, target_left, location).await
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
        let _guard = self.lock.acquire(conn).await?;
        let sibling = self.reload(conn, sibling).await?;
        let (target_left, location) = self.sibling_target(conn, &sibling, Action::Insert).await?;
        self.add_child_impl(conn, child, target_left, location).await
    }

    async fn remove<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        let node = self.reload(conn, node).await?;
        self.remove_impl(conn, &node).await
    }

    async fn move_to<C>(&self, conn: &C, node: &M, parent: &M, position: Position) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        let node = self.reload(conn, node).await?;
        let parent = self.reload(conn, parent).await?;
        self.copy_or_move_preconditions(conn, &parent, &node, false).await?;

        let (target_left, location) = self
            .resolve_target(conn, &parent, position, Some(&node), Action::Move)
            .await?;
        if location.relation() == Some(Relation::Sibling)
            && location.related().map(TreeNode::id) == Some(node.id())
        {
            return Ok(());
        }
        self.move_impl(conn, &node, target_left, location).await
    }

    async fn move_before<C>(&self, conn: &C, node: &M, sibling: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        if node.id() == sibling.id() {
            return Ok(());
        }
        let node = self.reload(conn, node).await?;
        let sibling = self.reload(conn, sibling).await?;
        self.copy_or_move_preconditions(conn, &sibling, &node, false).await?;

        let (target_left, location) = self.sibling_target(conn, &sibling, Action::Move).await?;
        self.move_impl(conn, &node, target_left, location).await
    }

    async fn move_to_be_root<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        let node = self.reload(conn, node).await?;
        if top_of(&node)? == node.id() {
            return Ok(());
        }
        self.move_impl(conn, &node, ROOT_LEFT, Location::root_level(Action::Move))
            .await
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
        let _guard = self.lock.acquire(conn).await?;
        let node = self.reload(conn, node).await?;
        let parent = self.reload(conn, parent).await?;
        self.copy_or_move_preconditions(conn, &parent, &node, false).await?;

        let (target_left, location) = self
            .resolve_target(conn, &parent, position, Some(&node), Action::Copy)
            .await?;
        self.copy_impl(conn, &node, target_left, location, template).await
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
        let _guard = self.lock.acquire(conn).await?;
        let node = self.reload(conn, node).await?;
        let sibling = self.reload(conn, sibling).await?;
        self.copy_or_move_preconditions(conn, &sibling, &node, true).await?;

        let (target_left, location) = self.sibling_target(conn, &sibling, Action::Copy).await?;
        self.copy_impl(conn, &node, target_left, location, template).await
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
        let _guard = self.lock.acquire(conn).await?;
        let node = self.reload(conn, node).await?;
        top_of(&node)?;
        self.copy_impl(conn, &node, ROOT_LEFT, Location::root_level(Action::Copy), template)
            .await
    }

    async fn update<C>(&self, conn: &C, node: M::ActiveModel) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        let id = M::active_id(&node)
            .ok_or_else(|| TreeError::precondition("can not update a node that is not persistent"))?;

        if self.config.check_unique_on_update() && self.unique.is_some() {
            let existing = self
                .find_impl(conn, id)
                .await?
                .ok_or_else(|| TreeError::precondition("updated node does not exist"))?;
            let root = self.root_impl(conn, &existing).await?;
            let location = Location::update_of(Some(root), Some(existing));
            self.check_unique(conn, std::slice::from_ref(&node), &location).await?;
        }

        Ok(node.update(conn).await?)
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
        let location = Location::update_of(root.cloned(), original.cloned());
        self.check_unique(conn, std::slice::from_ref(clone), &location).await
    }

    async fn remove_all<C>(&self, conn: &C) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        M::Entity::update_many()
            .col_expr(M::top_level_column(), Expr::value(Option::<M::Id>::None))
            .exec(conn)
            .await?;
        let removed = M::Entity::delete_many().exec(conn).await?;
        tracing::info!(
            entity = self.config.entity_name(),
            removed = removed.rows_affected,
            "removed all trees"
        );
        Ok(())
    }
}

#[async_trait]
impl<M: NestedSetsNode> UniquenessScope<M> for NestedSetsTree<M> {
    async fn count_in_tree<C>(&self, conn: &C, root: &M, condition: Condition) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        let condition = condition.add(M::top_level_column().eq(root.id()));
        Ok(self.select(condition, QueryMode::Valid).count(conn).await?)
    }

    async fn count_among_roots<C>(&self, conn: &C, condition: Condition) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        let condition = condition.add(root_condition::<M>());
        Ok(self.select(condition, QueryMode::Valid).count(conn).await?)
    }
}

#[async_trait]
impl<M: NestedSetsNode> Historicize<M> for NestedSetsTree<M> {
    type Carrier = M::Entity;

    fn install_validity(&mut self, validity: Validity<M::Entity>) {
        self.validity = Some(validity);
    }

    async fn roots_in<C>(&self, conn: &C, mode: QueryMode) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.select_roots(conn, mode).await
    }

    async fn find_in<C>(
        &self,
        conn: &C,
        parent: Option<&M>,
        criteria: &Criteria<M::Entity>,
        mode: QueryMode,
    ) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.select_nodes(conn, parent, criteria, mode).await
    }

    async fn tree_cacheable_in<C>(&self, conn: &C, parent: &M, mode: QueryMode) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        let parent = self.reload(conn, parent).await?;
        self.tree_in(conn, &parent, mode).await
    }

    fn valid_direct_children(&self, tree: &Vec<M>, at: DateTime<Utc>) -> Vec<M> {
        match &self.validity {
            Some(validity) => direct_children(tree, true, |node| validity.is_valid(node, at)),
            None => direct_children(tree, false, |_| true),
        }
    }

    async fn historicize<C>(&self, conn: &C, node: &M, at: DateTime<Utc>) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        let node = self.reload(conn, node).await?;
        let stamped = self.stamp_subtree(conn, &node, Some(at)).await?;
        tracing::debug!(entity = self.config.entity_name(), node = ?node.id(), stamped, "historicized subtree");
        Ok(())
    }

    async fn unremove<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        let node = self.reload(conn, node).await?;
        let restored = self.stamp_subtree(conn, &node, None).await?;
        tracing::debug!(entity = self.config.entity_name(), node = ?node.id(), restored, "restored subtree");
        Ok(())
    }

    async fn historicize_all<C>(&self, conn: &C, at: DateTime<Utc>) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        let validity = self
            .validity
            .as_ref()
            .ok_or_else(|| TreeError::configuration("engine has no validity columns"))?;
        let stamped = M::Entity::update_many()
            .col_expr(validity.valid_to(), Expr::value(Some(at)))
            .filter(with_optional(Condition::all(), validity.condition(QueryMode::Valid, at)))
            .exec(conn)
            .await?;
        tracing::info!(
            entity = self.config.entity_name(),
            stamped = stamped.rows_affected,
            "historicized all trees"
        );
        Ok(())
    }

    async fn remove_physically<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        let node = self.reload(conn, node).await?;
        self.remove_impl(conn, &node).await
    }

    async fn historicized_tops<C>(&self, conn: &C, root: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        let first = self
            .select(
                Condition::all().add(M::top_level_column().eq(root.id())),
                QueryMode::Removed,
            )
            .order_by_asc(M::left_column())
            .one(conn)
            .await?;
        Ok(first.into_iter().collect())
    }
}

fn top_of<M: NestedSetsNode>(node: &M) -> Result<M::Id, TreeError> {
    node.top_level().ok_or_else(|| {
        TreeError::precondition(format!("node {:?} is not member of a tree", node.id()))
    })
}

fn subtree_size<M: NestedSetsNode>(node: &M) -> i32 {
    (node.right() - node.left()) / 2 + 1
}

fn root_condition<M: NestedSetsNode>() -> Condition {
    Condition::all().add(Expr::col(M::top_level_column()).equals(M::id_column()))
}

fn subtree_condition<M: NestedSetsNode>(node: &M) -> Result<Condition, TreeError> {
    Ok(Condition::all()
        .add(M::top_level_column().eq(top_of(node)?))
        .add(M::left_column().gte(node.left()))
        .add(M::right_column().lte(node.right())))
}

fn ancestors_condition<M: NestedSetsNode>(node: &M) -> Result<Condition, TreeError> {
    Ok(Condition::all()
        .add(M::top_level_column().eq(top_of(node)?))
        .add(M::left_column().lt(node.left()))
        .add(M::right_column().gt(node.right())))
}

/// Direct children of the first node of a depth-first list, in one pass.
///
/// A node is the next child when its `left` is the expected boundary. With
/// `bridge_gaps`, index gaps left by rows missing from the list are bridged:
/// a node outside the current child is still the next child when no later
/// node starts at or before the expected boundary. `keep` filters the
/// returned children without affecting the boundaries.
pub(crate) fn direct_children<M, F>(nodes: &[M], bridge_gaps: bool, keep: F) -> Vec<M>
where
    M: NestedSetsNode,
    F: Fn(&M) -> bool,
{
    let Some((parent, candidates)) = nodes.split_first() else {
        return Vec::new();
    };
    let Some(first) = candidates.first() else {
        return Vec::new();
    };

    let mut children = Vec::new();
    let mut next_left = parent.left() + 1;
    let mut current_right = first.right();
    for (index, node) in candidates.iter().enumerate() {
        let is_next = node.left() == next_left
            || (bridge_gaps
                && node.right() >= current_right
                && candidates
                    .get(index + 1)
                    .map_or(true, |following| following.left() > next_left));
        if is_next {
            if keep(node) {
                children.push(node.clone());
            }
            current_right = node.right();
            next_left = node.right() + 1;
        }
    }
    children
}
