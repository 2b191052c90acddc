use std::fmt::Debug;
use std::hash::Hash;

use sea_orm::sea_query::{Nullable, ValueType};
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ActiveValue, EntityTrait, FromQueryResult,
    IdenStatic, IntoActiveModel, Iterable, Value,
};

use crate::config::TreeConfig;

/// Column type of a tree node's entity.
pub type Column<M> = <<M as TreeNode>::Entity as EntityTrait>::Column;

/// Column type of a closure-table node's path entity.
pub type PathColumn<M> = <<M as ClosureTableNode>::PathEntity as EntityTrait>::Column;

/// Trait implemented by SeaORM `Model` types that are indexed as tree nodes.
///
/// Implementations are normally provided by `#[derive(NestedSetsNode)]` or
/// `#[derive(ClosureTableNode)]`.
pub trait TreeNode:
    Clone + Debug + Send + Sync + 'static + IntoActiveModel<Self::ActiveModel> + FromQueryResult
{
    type Entity: EntityTrait<Model = Self>;
    type ActiveModel: ActiveModelTrait<Entity = Self::Entity>
        + ActiveModelBehavior
        + Send
        + Sync
        + 'static;
    type Id: Clone
        + Debug
        + Eq
        + Hash
        + Send
        + Sync
        + 'static
        + Into<Value>
        + ValueType
        + Nullable;

    fn tree_config() -> &'static TreeConfig;

    fn id(&self) -> Self::Id;
    fn id_column() -> Column<Self>;

    /// Identity of an active model; `None` while it is transient.
    fn active_id(active: &Self::ActiveModel) -> Option<Self::Id> {
        match active.get(Self::id_column()) {
            ActiveValue::Set(value) | ActiveValue::Unchanged(value) => {
                <Self::Id as ValueType>::try_from(value).ok()
            }
            ActiveValue::NotSet => None,
        }
    }

    /// Copy of every non-key column, without identity.
    fn clone_node(&self) -> Self::ActiveModel {
        let mut active = <Self::ActiveModel as ActiveModelBehavior>::new();
        let id_column = Self::id_column();
        for column in <Column<Self> as Iterable>::iter() {
            if column.as_str() != id_column.as_str() {
                active.set(column, model_value(self, column));
            }
        }
        active
    }
}

/// Node carrying nested-sets interval bounds and a reference to its tree's root.
pub trait NestedSetsNode: TreeNode {
    fn left_column() -> Column<Self>;
    fn right_column() -> Column<Self>;
    fn top_level_column() -> Column<Self>;

    fn left(&self) -> i32;
    fn right(&self) -> i32;
    fn top_level(&self) -> Option<Self::Id>;
}

/// Node whose structure lives in a separate path (ancestor/descendant) table.
pub trait ClosureTableNode: TreeNode {
    type PathEntity: EntityTrait<Model = Self::PathModel>;
    type PathModel: Clone
        + Debug
        + Send
        + Sync
        + 'static
        + FromQueryResult
        + IntoActiveModel<Self::PathActiveModel>;
    type PathActiveModel: ActiveModelTrait<Entity = Self::PathEntity>
        + ActiveModelBehavior
        + Send
        + Sync
        + 'static;

    fn path_ancestor_column() -> PathColumn<Self>;
    fn path_descendant_column() -> PathColumn<Self>;
    fn path_depth_column() -> PathColumn<Self>;
    fn path_order_index_column() -> PathColumn<Self>;

    fn path_ancestor(path: &Self::PathModel) -> Self::Id;
    fn path_descendant(path: &Self::PathModel) -> Self::Id;
    fn path_depth(path: &Self::PathModel) -> i32;
    fn path_order_index(path: &Self::PathModel) -> i32;

    fn build_path_row(
        ancestor: Self::Id,
        descendant: Self::Id,
        depth: i32,
        order_index: i32,
    ) -> Self::PathActiveModel;
}

/// Read a column of a node model.
pub(crate) fn model_value<M: TreeNode>(model: &M, column: Column<M>) -> Value {
    model
        .clone()
        .into_active_model()
        .get(column)
        .into_value()
        .unwrap_or(Value::Bool(None))
}

/// Read a column of an active model; `None` when the column is not set.
pub(crate) fn active_value<M: TreeNode>(active: &M::ActiveModel, column: Column<M>) -> Option<Value> {
    active.get(column).into_value()
}
