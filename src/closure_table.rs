//! Closure-table engine: structure lives in a path table holding one row per
//! reachable `(ancestor, descendant)` pair, self references included.
//! Depth-1 rows carry the 0-based sibling order index.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Query, SelectStatement};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Select,
};

use crate::cache::{Link, SubtreeCache};
use crate::config::{NodeRemoval, OrderTracking, TreeConfig, TreeOptions};
use crate::engine::{CopiedNodeRenamer, Position, TreeEngine};
use crate::error::TreeError;
use crate::location::{Action, Location, Relation};
use crate::lock::MutationLock;
use crate::query::{with_optional, Criteria, QueryMode, Validity};
use crate::temporal::Historicize;
use crate::traits::ClosureTableNode;
use crate::uniqueness::{UniqueConstraint, UniquenessScope};

/// Order index stored on paths that are not direct-child links.
pub const NO_ORDER_INDEX: i32 = -1;

/// Tree engine storing structure in a separate ancestor/descendant path table.
pub struct ClosureTableTree<M: ClosureTableNode> {
    config: TreeConfig,
    unique: Option<UniqueConstraint<M>>,
    renamer: Option<CopiedNodeRenamer<M>>,
    validity: Option<Validity<M::PathEntity>>,
    lock: MutationLock,
}

/// Paths a new link is cloned from, with the resolved order index.
struct Connection<M: ClosureTableNode> {
    position: Option<i32>,
    paths: Vec<M::PathModel>,
    from_parent: bool,
}

impl<M: ClosureTableNode> Default for ClosureTableTree<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ClosureTableNode> ClosureTableTree<M> {
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

    /// The `depth = 0` path of `node`, absent when the node is not part of a tree.
    pub async fn self_path<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
    ) -> Result<Option<M::PathModel>, TreeError> {
        let mut paths = self
            .paths(
                Condition::all()
                    .add(M::path_ancestor_column().eq(node.id()))
                    .add(M::path_descendant_column().eq(node.id())),
                QueryMode::Valid,
            )
            .all(conn)
            .await?;
        if paths.len() > 1 {
            return Err(TreeError::corruption(format!(
                "found {} self paths for node {:?}",
                paths.len(),
                node.id()
            )));
        }
        Ok(paths.pop())
    }

    fn is_temporal(&self) -> bool {
        self.validity.is_some()
    }

    fn tracks_order(&self) -> bool {
        self.config.order_tracking() == OrderTracking::Tracked
    }

    fn path_filter(&self, mode: QueryMode) -> Option<Condition> {
        self.validity
            .as_ref()
            .and_then(|validity| validity.condition(mode, Utc::now()))
    }

    fn paths(&self, condition: Condition, mode: QueryMode) -> Select<M::PathEntity> {
        M::PathEntity::find().filter(with_optional(condition, self.path_filter(mode)))
    }

    /// `SELECT descendant FROM paths WHERE ancestor = ?`, validity filtered by `mode`.
    fn subtree_query(&self, ancestor: &M::Id, mode: QueryMode) -> SelectStatement {
        let mut query = Query::select();
        query
            .column(M::path_descendant_column())
            .from(M::PathEntity::default())
            .and_where(M::path_ancestor_column().eq(ancestor.clone()));
        if let Some(filter) = self.path_filter(mode) {
            query.cond_where(filter);
        }
        query
    }

    /// Self paths of nodes that are nobody's descendant.
    fn roots_query(&self, mode: QueryMode) -> SelectStatement {
        let mut descendants = Query::select();
        descendants
            .column(M::path_descendant_column())
            .from(M::PathEntity::default())
            .and_where(M::path_depth_column().gt(0));

        let mut query = Query::select();
        query
            .column(M::path_descendant_column())
            .from(M::PathEntity::default())
            .and_where(M::path_depth_column().eq(0))
            .and_where(M::path_descendant_column().not_in_subquery(descendants));
        if let Some(filter) = self.path_filter(mode) {
            query.cond_where(filter);
        }
        query
    }

    async fn find_impl<C: ConnectionTrait>(&self, conn: &C, id: M::Id) -> Result<Option<M>, TreeError> {
        let node = M::Entity::find()
            .filter(M::id_column().eq(id))
            .one(conn)
            .await?;
        Ok(node)
    }

    /// Nodes for `ids`, in the order of `ids`.
    async fn load_nodes<C: ConnectionTrait>(&self, conn: &C, ids: &[M::Id]) -> Result<Vec<M>, TreeError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = M::Entity::find()
            .filter(M::id_column().is_in(ids.iter().cloned()))
            .all(conn)
            .await?;
        let mut by_id: HashMap<M::Id, M> = rows.into_iter().map(|node| (node.id(), node)).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn subtree_ids<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
        mode: QueryMode,
    ) -> Result<Vec<M::Id>, TreeError> {
        let paths = self
            .paths(
                Condition::all().add(M::path_ancestor_column().eq(node.id())),
                mode,
            )
            .order_by_asc(M::path_depth_column())
            .all(conn)
            .await?;
        Ok(paths.iter().map(M::path_descendant).collect())
    }

    async fn exists<C: ConnectionTrait>(&self, conn: &C, id: M::Id) -> Result<bool, TreeError> {
        let count = self
            .paths(
                Condition::all().add(M::path_descendant_column().eq(id)),
                QueryMode::Valid,
            )
            .count(conn)
            .await?;
        Ok(count > 0)
    }

    async fn is_root_impl<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<bool, TreeError> {
        let incoming = self
            .paths(
                Condition::all()
                    .add(M::path_descendant_column().eq(node.id()))
                    .add(M::path_depth_column().gt(0)),
                QueryMode::Valid,
            )
            .count(conn)
            .await?;
        Ok(incoming == 0)
    }

    async fn select_roots<C: ConnectionTrait>(&self, conn: &C, mode: QueryMode) -> Result<Vec<M>, TreeError> {
        let root_paths = M::PathEntity::find()
            .filter(M::path_descendant_column().in_subquery(self.roots_query(mode)))
            .filter(M::path_depth_column().eq(0))
            .order_by_asc(M::path_descendant_column())
            .all(conn)
            .await?;
        let mut ids: Vec<M::Id> = root_paths.iter().map(M::path_descendant).collect();
        ids.dedup();
        self.load_nodes(conn, &ids).await
    }

    async fn select_nodes<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: Option<&M>,
        criteria: &Criteria<M::Entity>,
        mode: QueryMode,
    ) -> Result<Vec<M>, TreeError> {
        let mut members = Query::select();
        members
            .column(M::path_descendant_column())
            .from(M::PathEntity::default());
        if let Some(parent) = parent {
            members.and_where(M::path_ancestor_column().eq(parent.id()));
        }
        if let Some(filter) = self.path_filter(mode) {
            members.cond_where(filter);
        }

        let nodes = M::Entity::find()
            .filter(criteria.condition())
            .filter(M::id_column().in_subquery(members))
            .order_by_asc(M::id_column())
            .all(conn)
            .await?;
        Ok(nodes)
    }

    async fn cache_subtree<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: &M,
        mode: QueryMode,
    ) -> Result<SubtreeCache<M>, TreeError> {
        let links = M::PathEntity::find()
            .filter(
                Condition::any()
                    .add(M::path_depth_column().eq(1))
                    .add(
                        Condition::all()
                            .add(M::path_depth_column().eq(0))
                            .add(M::path_ancestor_column().eq(parent.id())),
                    ),
            )
            .filter(M::path_descendant_column().in_subquery(self.subtree_query(&parent.id(), mode)))
            .order_by_asc(M::path_depth_column())
            .order_by_asc(M::path_ancestor_column())
            .order_by_asc(M::path_order_index_column())
            .all(conn)
            .await?;

        let Some(root_path) = links.iter().find(|path| M::path_depth(path) == 0) else {
            return Ok(SubtreeCache::empty());
        };
        let root_valid = self.path_is_valid(root_path);

        let mut ids = vec![parent.id()];
        ids.extend(
            links
                .iter()
                .filter(|path| M::path_depth(path) == 1)
                .map(M::path_descendant),
        );
        let mut nodes: HashMap<M::Id, M> = self
            .load_nodes(conn, &ids)
            .await?
            .into_iter()
            .map(|node| (node.id(), node))
            .collect();
        let Some(root) = nodes.get(&parent.id()).cloned() else {
            return Ok(SubtreeCache::empty());
        };

        let mut children = Vec::with_capacity(links.len());
        for path in links.iter().filter(|path| M::path_depth(path) == 1) {
            if let Some(child) = nodes.remove(&M::path_descendant(path)) {
                children.push(Link {
                    parent: M::path_ancestor(path),
                    child,
                    valid: self.path_is_valid(path),
                });
            }
        }

        let cache = SubtreeCache::build(root, root_valid, children);
        tracing::trace!(entity = self.config.entity_name(), root = ?parent.id(), nodes = cache.len(), "cached subtree");
        Ok(cache)
    }

    fn path_is_valid(&self, path: &M::PathModel) -> bool {
        self.validity
            .as_ref()
            .map_or(true, |validity| validity.is_valid(path, Utc::now()))
    }

    async fn path_impl<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<Vec<M>, TreeError> {
        let paths = self
            .paths(
                Condition::all()
                    .add(M::path_descendant_column().eq(node.id()))
                    .add(M::path_depth_column().gt(0)),
                QueryMode::Valid,
            )
            .order_by_desc(M::path_depth_column())
            .all(conn)
            .await?;
        let ids: Vec<M::Id> = paths.iter().map(M::path_ancestor).collect();
        self.load_nodes(conn, &ids).await
    }

    async fn root_impl<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<M, TreeError> {
        let path = self.path_impl(conn, node).await?;
        Ok(path.into_iter().next().unwrap_or_else(|| node.clone()))
    }

    async fn parent_impl<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<Option<M>, TreeError> {
        let parents = self
            .paths(
                Condition::all()
                    .add(M::path_descendant_column().eq(node.id()))
                    .add(M::path_depth_column().eq(1)),
                QueryMode::Valid,
            )
            .all(conn)
            .await?;
        match parents.as_slice() {
            [] => Ok(None),
            [path] => self.find_impl(conn, M::path_ancestor(path)).await,
            _ => Err(TreeError::corruption(format!(
                "found {} parents for node {:?}",
                parents.len(),
                node.id()
            ))),
        }
    }

    async fn location<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: Option<&M>,
        sibling: Option<&M>,
        action: Action,
    ) -> Result<Location<M>, TreeError> {
        let (related, relation) = match (sibling, parent) {
            (Some(sibling), _) => (Some(sibling.clone()), Some(Relation::Sibling)),
            (None, Some(parent)) => (Some(parent.clone()), Some(Relation::Parent)),
            (None, None) => (None, None),
        };
        let root = match &related {
            Some(related) => Some(self.root_impl(conn, related).await?),
            None => None,
        };
        Ok(Location::new(root, related, relation, action))
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

    async fn ensure_persistent<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<(), TreeError> {
        match self.find_impl(conn, node.id()).await? {
            Some(_) => Ok(()),
            None => Err(TreeError::precondition(format!(
                "{} {:?} is not persistent",
                self.config.entity_name(),
                node.id()
            ))),
        }
    }

    /// Rejects targets inside the subtree of `node`, and roots as siblings.
    async fn copy_or_move_preconditions<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
        parent: Option<&M>,
        sibling: Option<&M>,
        allow_self: bool,
    ) -> Result<(), TreeError> {
        self.ensure_persistent(conn, node).await?;
        if let Some(sibling) = sibling {
            if self.is_root_impl(conn, sibling).await? {
                return Err(TreeError::precondition(format!(
                    "sibling {:?} is a root",
                    sibling.id()
                )));
            }
        }
        if let Some(target) = sibling.or(parent) {
            let inside = if target.id() == node.id() {
                !allow_self
            } else {
                self.is_child_of(conn, target, node).await?
            };
            if inside {
                return Err(TreeError::precondition(format!(
                    "target {:?} lies inside the subtree of {:?}",
                    target.id(),
                    node.id()
                )));
            }
        }
        Ok(())
    }

    /// Paths to clone for a new link below `parent` or before `sibling`.
    async fn connection<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: Option<&M>,
        sibling: Option<&M>,
        position: Position,
    ) -> Result<Connection<M>, TreeError> {
        let position = position.index().map(|index| i32::try_from(index).unwrap_or(i32::MAX));
        if let Some(parent) = parent {
            // historicized chains included
            let paths = M::PathEntity::find()
                .filter(M::path_descendant_column().eq(parent.id()))
                .all(conn)
                .await?;
            let self_paths = paths.iter().filter(|path| M::path_depth(path) == 0).count();
            if self_paths > 1 {
                return Err(TreeError::corruption(format!(
                    "found {self_paths} self paths for node {:?}",
                    parent.id()
                )));
            }
            return Ok(Connection {
                position,
                paths,
                from_parent: true,
            });
        }
        if let Some(sibling) = sibling {
            let paths = M::PathEntity::find()
                .filter(M::path_descendant_column().eq(sibling.id()))
                .filter(M::path_depth_column().gt(0))
                .order_by_asc(M::path_depth_column())
                .all(conn)
                .await?;
            let Some(link) = paths.first() else {
                return Err(TreeError::precondition(format!(
                    "sibling {:?} is a root",
                    sibling.id()
                )));
            };
            return Ok(Connection {
                position: Some(M::path_order_index(link).max(0)),
                paths,
                from_parent: false,
            });
        }
        Ok(Connection {
            position,
            paths: Vec::new(),
            from_parent: false,
        })
    }

    /// Link `child` (at `depth_below` inside a moved or copied subtree) to the
    /// ancestor chain of `connection`.
    async fn clone_paths<C: ConnectionTrait>(
        &self,
        conn: &C,
        child: &M::Id,
        depth_below: i32,
        connection: &Connection<M>,
    ) -> Result<(), TreeError> {
        for path in &connection.paths {
            let depth = M::path_depth(path) + depth_below + i32::from(connection.from_parent);
            let order_index = if depth == 1 {
                let parent = if connection.from_parent {
                    M::path_descendant(path)
                } else {
                    M::path_ancestor(path)
                };
                self.create_gap(conn, &parent, connection.position).await?
            } else {
                NO_ORDER_INDEX
            };
            let row = M::build_path_row(M::path_ancestor(path), child.clone(), depth, order_index);
            M::PathEntity::insert(row).exec_without_returning(conn).await?;
        }
        Ok(())
    }

    async fn connect<C: ConnectionTrait>(
        &self,
        conn: &C,
        connection: &Connection<M>,
        subtree: &[(M::Id, i32)],
    ) -> Result<(), TreeError> {
        for (descendant, depth) in subtree {
            self.clone_paths(conn, descendant, *depth, connection).await?;
        }
        Ok(())
    }

    /// Direct-child links of `parent` by order index, historicized ones included.
    async fn child_links<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: &M::Id,
    ) -> Result<Vec<M::PathModel>, TreeError> {
        let links = M::PathEntity::find()
            .filter(M::path_ancestor_column().eq(parent.clone()))
            .filter(M::path_depth_column().eq(1))
            .order_by_asc(M::path_order_index_column())
            .all(conn)
            .await?;
        Ok(links)
    }

    /// Other direct-child links of the parent of `node`, by order index.
    async fn sibling_links<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M::Id,
    ) -> Result<Vec<M::PathModel>, TreeError> {
        let parents: Vec<M::Id> = M::PathEntity::find()
            .filter(M::path_descendant_column().eq(node.clone()))
            .filter(M::path_depth_column().eq(1))
            .all(conn)
            .await?
            .iter()
            .map(M::path_ancestor)
            .collect();
        if parents.is_empty() {
            return Ok(Vec::new());
        }
        let siblings = M::PathEntity::find()
            .filter(M::path_ancestor_column().is_in(parents))
            .filter(M::path_depth_column().eq(1))
            .filter(M::path_descendant_column().ne(node.clone()))
            .order_by_asc(M::path_order_index_column())
            .all(conn)
            .await?;
        Ok(siblings)
    }

    async fn set_order_index<C: ConnectionTrait>(
        &self,
        conn: &C,
        link: &M::PathModel,
        order_index: i32,
    ) -> Result<(), TreeError> {
        if M::path_order_index(link) == order_index {
            return Ok(());
        }
        M::PathEntity::update_many()
            .col_expr(M::path_order_index_column(), Expr::value(order_index))
            .filter(M::path_ancestor_column().eq(M::path_ancestor(link)))
            .filter(M::path_descendant_column().eq(M::path_descendant(link)))
            .filter(M::path_depth_column().eq(1))
            .exec(conn)
            .await?;
        Ok(())
    }

    /// Make room at `position` among the children of `parent`; returns the
    /// order index of the new link.
    async fn create_gap<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: &M::Id,
        position: Option<i32>,
    ) -> Result<i32, TreeError> {
        if !self.tracks_order() {
            return Ok(0);
        }
        let children = self.child_links(conn, parent).await?;
        let count = i32::try_from(children.len()).unwrap_or(i32::MAX);
        let position = match position {
            Some(position) if position < count => position,
            _ => return Ok(count),
        };
        for (index, link) in children.iter().enumerate().rev() {
            let index = i32::try_from(index).unwrap_or(i32::MAX);
            if index < position {
                break;
            }
            self.set_order_index(conn, link, index + 1).await?;
        }
        tracing::debug!(entity = self.config.entity_name(), ?parent, position, "created order gap");
        Ok(position)
    }

    /// Renumber `siblings` from `removed` on, after the link at `removed` went away.
    async fn close_gap<C: ConnectionTrait>(
        &self,
        conn: &C,
        siblings: &[M::PathModel],
        removed: Option<i32>,
    ) -> Result<(), TreeError> {
        let Some(removed) = removed.filter(|removed| *removed >= 0) else {
            return Ok(());
        };
        if !self.tracks_order() {
            return Ok(());
        }
        let start = usize::try_from(removed).unwrap_or(usize::MAX);
        for (index, link) in siblings.iter().enumerate().skip(start) {
            self.set_order_index(conn, link, i32::try_from(index).unwrap_or(i32::MAX))
                .await?;
        }
        Ok(())
    }

    async fn add_child_impl<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: Option<&M>,
        sibling: Option<&M>,
        child: M::ActiveModel,
        position: Position,
    ) -> Result<M, TreeError> {
        // a persistent node may join when no path references it yet
        if let Some(id) = M::active_id(&child) {
            if self.exists(conn, id).await? {
                return Err(TreeError::precondition("node is already part of a tree"));
            }
        }

        let location = self.location(conn, parent, sibling, Action::Insert).await?;
        self.check_unique(conn, std::slice::from_ref(&child), &location).await?;
        let connection = self.connection(conn, parent, sibling, position).await?;

        let child = match M::active_id(&child) {
            Some(id) => self
                .find_impl(conn, id)
                .await?
                .ok_or_else(|| TreeError::precondition("node to add is not persistent"))?,
            None => child.insert(conn).await?,
        };

        M::PathEntity::insert(M::build_path_row(child.id(), child.id(), 0, NO_ORDER_INDEX))
            .exec_without_returning(conn)
            .await?;
        self.clone_paths(conn, &child.id(), 0, &connection).await?;

        tracing::debug!(
            entity = self.config.entity_name(),
            node = ?child.id(),
            position = ?connection.position,
            "added child"
        );
        Ok(child)
    }

    /// Delete the paths entering the subtree of `node` from outside.
    async fn disconnect<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<(), TreeError> {
        let inside = self.subtree_ids(conn, node, QueryMode::All).await?;
        let incoming = Condition::all()
            .add(M::path_descendant_column().is_in(inside.iter().cloned()))
            .add(M::path_ancestor_column().is_not_in(inside.iter().cloned()));

        let old_position = M::PathEntity::find()
            .filter(incoming.clone())
            .filter(M::path_depth_column().eq(1))
            .one(conn)
            .await?
            .map(|link| M::path_order_index(&link));
        let siblings = self.sibling_links(conn, &node.id()).await?;

        let removed = M::PathEntity::delete_many().filter(incoming).exec(conn).await?;
        self.close_gap(conn, &siblings, old_position).await?;

        tracing::debug!(
            entity = self.config.entity_name(),
            node = ?node.id(),
            removed = removed.rows_affected,
            "disconnected subtree"
        );
        Ok(())
    }

    async fn move_impl<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
        parent: Option<&M>,
        position: Position,
        sibling: Option<&M>,
    ) -> Result<(), TreeError> {
        let location = self.location(conn, parent, sibling, Action::Move).await?;
        let candidate = node.clone().into_active_model();
        self.check_unique(conn, std::slice::from_ref(&candidate), &location).await?;

        self.disconnect(conn, node).await?;
        if parent.is_none() && sibling.is_none() {
            return Ok(());
        }

        let subtree: Vec<(M::Id, i32)> = self
            .paths(
                Condition::all().add(M::path_ancestor_column().eq(node.id())),
                QueryMode::Valid,
            )
            .all(conn)
            .await?
            .iter()
            .map(|path| (M::path_descendant(path), M::path_depth(path)))
            .collect();
        let connection = self.connection(conn, parent, sibling, position).await?;
        self.connect(conn, &connection, &subtree).await
    }

    async fn copy_impl<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
        parent: Option<&M>,
        position: Position,
        sibling: Option<&M>,
        template: Option<M::ActiveModel>,
    ) -> Result<M, TreeError> {
        // historicized members are left behind
        let members = self.subtree_ids(conn, node, QueryMode::Valid).await?;
        if members.is_empty() {
            return Err(TreeError::precondition(format!(
                "node {:?} is not part of a tree",
                node.id()
            )));
        }
        let structure = M::PathEntity::find()
            .filter(M::path_descendant_column().is_in(members.iter().cloned()))
            .filter(M::path_ancestor_column().is_in(members.iter().cloned()))
            .order_by_asc(M::path_depth_column())
            .order_by_asc(M::path_ancestor_column())
            .order_by_asc(M::path_order_index_column())
            .all(conn)
            .await?;

        let mut order = vec![node.id()];
        order.extend(members.iter().filter(|id| **id != node.id()).cloned());
        let originals = self.load_nodes(conn, &order).await?;

        let mut template = template;
        let mut clones = Vec::with_capacity(originals.len());
        for original in &originals {
            let mut clone = match template.take() {
                Some(template) if original.id() == node.id() => template,
                _ => original.clone_node(),
            };
            if let Some(renamer) = &self.renamer {
                renamer(&mut clone);
            }
            clones.push(clone);
        }

        let location = self.location(conn, parent, sibling, Action::Copy).await?;
        self.check_unique(conn, &clones, &location).await?;
        let connection = self.connection(conn, parent, sibling, position).await?;

        let mut copies: HashMap<M::Id, M::Id> = HashMap::with_capacity(clones.len());
        let mut copied = None;
        for (original, clone) in originals.iter().zip(clones) {
            let saved = clone.insert(conn).await?;
            copies.insert(original.id(), saved.id());
            if copied.is_none() {
                copied = Some(saved);
            }
        }
        let copied = copied.ok_or_else(|| TreeError::precondition("nothing to copy"))?;

        let mut subtree = Vec::new();
        let mut rows = Vec::with_capacity(structure.len());
        for path in &structure {
            let (Some(ancestor), Some(descendant)) = (
                copies.get(&M::path_ancestor(path)),
                copies.get(&M::path_descendant(path)),
            ) else {
                continue;
            };
            if M::path_ancestor(path) == node.id() {
                subtree.push((descendant.clone(), M::path_depth(path)));
            }
            rows.push(M::build_path_row(
                ancestor.clone(),
                descendant.clone(),
                M::path_depth(path),
                M::path_order_index(path),
            ));
        }
        if !rows.is_empty() {
            M::PathEntity::insert_many(rows).exec_without_returning(conn).await?;
        }

        if parent.is_some() || sibling.is_some() {
            self.connect(conn, &connection, &subtree).await?;
        }

        tracing::debug!(
            entity = self.config.entity_name(),
            source = ?node.id(),
            copy = ?copied.id(),
            nodes = copies.len(),
            "copied subtree"
        );
        Ok(copied)
    }

    /// Delete the subtree of `node`: all paths reaching into it, and the
    /// node rows when configured.
    async fn remove_tree<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<(), TreeError> {
        let close_gap = !self.is_temporal();
        let siblings = if close_gap {
            self.sibling_links(conn, &node.id()).await?
        } else {
            Vec::new()
        };

        let members = self.subtree_ids(conn, node, QueryMode::All).await?;
        let old_position = M::PathEntity::find()
            .filter(M::path_descendant_column().eq(node.id()))
            .filter(M::path_depth_column().eq(1))
            .one(conn)
            .await?
            .map(|link| M::path_order_index(&link));

        let paths = M::PathEntity::delete_many()
            .filter(M::path_descendant_column().is_in(members.iter().cloned()))
            .exec(conn)
            .await?;
        if close_gap {
            self.close_gap(conn, &siblings, old_position).await?;
        }

        let mut nodes = 0;
        if self.config.node_removal() == NodeRemoval::DeleteNodes && !members.is_empty() {
            nodes = M::Entity::delete_many()
                .filter(M::id_column().is_in(members.iter().cloned()))
                .exec(conn)
                .await?
                .rows_affected;
        }

        tracing::debug!(
            entity = self.config.entity_name(),
            node = ?node.id(),
            paths = paths.rows_affected,
            nodes,
            "removed subtree"
        );
        Ok(())
    }

    async fn stamp_paths<C: ConnectionTrait>(
        &self,
        conn: &C,
        members: Vec<M::Id>,
        valid_to: Option<DateTime<Utc>>,
        mode: QueryMode,
    ) -> Result<u64, TreeError> {
        let validity = self
            .validity
            .as_ref()
            .ok_or_else(|| TreeError::configuration("engine has no validity columns"))?;
        if members.is_empty() {
            return Ok(0);
        }
        let condition = Condition::all().add(M::path_descendant_column().is_in(members));
        let stamped = M::PathEntity::update_many()
            .col_expr(validity.valid_to(), Expr::value(valid_to))
            .filter(with_optional(condition, self.path_filter(mode)))
            .exec(conn)
            .await?;
        Ok(stamped.rows_affected)
    }
}

#[async_trait]
impl<M: ClosureTableNode> TreeEngine<M> for ClosureTableTree<M> {
    type CachedTree = SubtreeCache<M>;

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
        if self.find_impl(conn, node.id()).await?.is_none() {
            return Ok(false);
        }
        self.is_root_impl(conn, node).await
    }

    async fn create_root<C>(&self, conn: &C, root: M::ActiveModel) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        self.add_child_impl(conn, None, None, root, Position::Append).await
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
        let size = self
            .paths(
                Condition::all().add(M::path_ancestor_column().eq(node.id())),
                QueryMode::Valid,
            )
            .count(conn)
            .await?;
        Ok(size)
    }

    async fn tree<C>(&self, conn: &C, parent: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        Ok(self.tree_cacheable(conn, parent).await?.into_vec())
    }

    async fn tree_cacheable<C>(&self, conn: &C, parent: &M) -> Result<SubtreeCache<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.cache_subtree(conn, parent, QueryMode::Valid).await
    }

    fn find_sub_tree(&self, parent: &M, tree: &SubtreeCache<M>) -> Result<SubtreeCache<M>, TreeError> {
        tree.sub_tree(parent).ok_or_else(|| {
            TreeError::precondition(format!("node {:?} is not part of the cached tree", parent.id()))
        })
    }

    fn find_direct_children(&self, tree: &SubtreeCache<M>) -> Vec<M> {
        tree.root()
            .map(|root| tree.children_of(root))
            .unwrap_or_default()
    }

    async fn children<C>(&self, conn: &C, parent: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        let links = self
            .paths(
                Condition::all()
                    .add(M::path_ancestor_column().eq(parent.id()))
                    .add(M::path_depth_column().eq(1)),
                QueryMode::Valid,
            )
            .order_by_asc(M::path_order_index_column())
            .all(conn)
            .await?;
        let ids: Vec<M::Id> = links.iter().map(M::path_descendant).collect();
        self.load_nodes(conn, &ids).await
    }

    async fn child_count<C>(&self, conn: &C, parent: &M) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        let count = self
            .paths(
                Condition::all()
                    .add(M::path_ancestor_column().eq(parent.id()))
                    .add(M::path_depth_column().eq(1)),
                QueryMode::Valid,
            )
            .count(conn)
            .await?;
        Ok(count)
    }

    async fn is_leaf<C>(&self, conn: &C, node: &M) -> Result<bool, TreeError>
    where
        C: ConnectionTrait,
    {
        Ok(self.child_count(conn, node).await? == 0)
    }

    async fn parent<C>(&self, conn: &C, node: &M) -> Result<Option<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.parent_impl(conn, node).await
    }

    async fn root<C>(&self, conn: &C, node: &M) -> Result<M, TreeError>
    where
        C: ConnectionTrait,
    {
        self.root_impl(conn, node).await
    }

    async fn path<C>(&self, conn: &C, node: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.path_impl(conn, node).await
    }

    async fn level<C>(&self, conn: &C, node: &M) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        let paths = self
            .paths(
                Condition::all().add(M::path_descendant_column().eq(node.id())),
                QueryMode::Valid,
            )
            .count(conn)
            .await?;
        Ok(paths.saturating_sub(1))
    }

    async fn is_child_of<C>(&self, conn: &C, child: &M, parent: &M) -> Result<bool, TreeError>
    where
        C: ConnectionTrait,
    {
        if child.id() == parent.id() {
            return Ok(false);
        }
        let count = self
            .paths(
                Condition::all()
                    .add(M::path_ancestor_column().eq(parent.id()))
                    .add(M::path_descendant_column().eq(child.id())),
                QueryMode::Valid,
            )
            .count(conn)
            .await?;
        if count > 1 {
            return Err(TreeError::corruption(format!(
                "found {count} paths from {:?} to {:?}",
                parent.id(),
                child.id()
            )));
        }
        Ok(count == 1)
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
        self.add_child_impl(conn, Some(parent), None, child, position).await
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
        self.add_child_impl(conn, None, Some(sibling), child, Position::Append)
            .await
    }

    async fn remove<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        self.ensure_persistent(conn, node).await?;
        self.remove_tree(conn, node).await
    }

    async fn move_to<C>(&self, conn: &C, node: &M, parent: &M, position: Position) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        self.copy_or_move_preconditions(conn, node, Some(parent), None, false)
            .await?;
        self.move_impl(conn, node, Some(parent), position, None).await
    }

    async fn move_before<C>(&self, conn: &C, node: &M, sibling: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        if node.id() == sibling.id() {
            return Ok(());
        }
        self.copy_or_move_preconditions(conn, node, None, Some(sibling), false)
            .await?;
        self.move_impl(conn, node, None, Position::Append, Some(sibling))
            .await
    }

    async fn move_to_be_root<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        self.ensure_persistent(conn, node).await?;
        if self.is_root_impl(conn, node).await? {
            return Ok(());
        }
        self.move_impl(conn, node, None, Position::Append, None).await
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
        self.copy_or_move_preconditions(conn, node, Some(parent), None, false)
            .await?;
        self.copy_impl(conn, node, Some(parent), position, None, template)
            .await
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
        self.copy_or_move_preconditions(conn, node, None, Some(sibling), true)
            .await?;
        self.copy_impl(conn, node, None, Position::Append, Some(sibling), template)
            .await
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
        self.copy_or_move_preconditions(conn, node, None, None, false)
            .await?;
        self.copy_impl(conn, node, None, Position::Append, None, template)
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
        let paths = M::PathEntity::delete_many().exec(conn).await?;
        let mut nodes = 0;
        if self.config.node_removal() == NodeRemoval::DeleteNodes {
            nodes = M::Entity::delete_many().exec(conn).await?.rows_affected;
        }
        tracing::info!(
            entity = self.config.entity_name(),
            paths = paths.rows_affected,
            nodes,
            "removed all trees"
        );
        Ok(())
    }
}

#[async_trait]
impl<M: ClosureTableNode> UniquenessScope<M> for ClosureTableTree<M> {
    async fn count_in_tree<C>(&self, conn: &C, root: &M, condition: Condition) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        let count = M::Entity::find()
            .filter(condition)
            .filter(M::id_column().in_subquery(self.subtree_query(&root.id(), QueryMode::Valid)))
            .count(conn)
            .await?;
        Ok(count)
    }

    async fn count_among_roots<C>(&self, conn: &C, condition: Condition) -> Result<u64, TreeError>
    where
        C: ConnectionTrait,
    {
        let count = M::Entity::find()
            .filter(condition)
            .filter(M::id_column().in_subquery(self.roots_query(QueryMode::Valid)))
            .count(conn)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl<M: ClosureTableNode> Historicize<M> for ClosureTableTree<M> {
    type Carrier = M::PathEntity;

    fn install_validity(&mut self, validity: Validity<M::PathEntity>) {
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

    async fn tree_cacheable_in<C>(
        &self,
        conn: &C,
        parent: &M,
        mode: QueryMode,
    ) -> Result<SubtreeCache<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        self.cache_subtree(conn, parent, mode).await
    }

    /// Validity as recorded when the cache was built; `at` is not re-evaluated.
    fn valid_direct_children(&self, tree: &SubtreeCache<M>, _at: DateTime<Utc>) -> Vec<M> {
        tree.root()
            .map(|root| tree.valid_children_of(root))
            .unwrap_or_default()
    }

    async fn historicize<C>(&self, conn: &C, node: &M, at: DateTime<Utc>) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        self.ensure_persistent(conn, node).await?;
        let members = self.subtree_ids(conn, node, QueryMode::Valid).await?;
        let stamped = self
            .stamp_paths(conn, members, Some(at), QueryMode::Valid)
            .await?;
        tracing::debug!(entity = self.config.entity_name(), node = ?node.id(), stamped, "historicized subtree");
        Ok(())
    }

    async fn unremove<C>(&self, conn: &C, node: &M) -> Result<(), TreeError>
    where
        C: ConnectionTrait,
    {
        let _guard = self.lock.acquire(conn).await?;
        self.ensure_persistent(conn, node).await?;
        let members = self.subtree_ids(conn, node, QueryMode::All).await?;
        let restored = self.stamp_paths(conn, members, None, QueryMode::All).await?;
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
        let stamped = M::PathEntity::update_many()
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
        self.ensure_persistent(conn, node).await?;
        self.remove_tree(conn, node).await
    }

    async fn historicized_tops<C>(&self, conn: &C, root: &M) -> Result<Vec<M>, TreeError>
    where
        C: ConnectionTrait,
    {
        let removed = self
            .paths(
                Condition::all().add(M::path_ancestor_column().eq(root.id())),
                QueryMode::Removed,
            )
            .order_by_asc(M::path_depth_column())
            .all(conn)
            .await?;
        let Some(top_depth) = removed.first().map(M::path_depth) else {
            return Ok(Vec::new());
        };
        let mut ids: Vec<M::Id> = Vec::new();
        for path in removed.iter().take_while(|path| M::path_depth(path) == top_depth) {
            let id = M::path_descendant(path);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.load_nodes(conn, &ids).await
    }
}
