//! Tree indexing for SeaORM entities.
//!
//! Two interchangeable engines maintain a hierarchy over an existing entity:
//! [`NestedSetsTree`] stores left/right interval bounds on the node rows,
//! [`ClosureTableTree`] keeps every ancestor/descendant pair in a separate
//! path table. Both implement [`TreeEngine`], can enforce a
//! [`UniqueConstraint`], and can be wrapped in a [`TemporalTree`] so removals
//! become validity-period stamps instead of deletes.
//!
//! Every operation takes the connection or transaction to run on. Structural
//! mutations take the engine's mutation lock and, on PostgreSQL, a
//! transaction-scoped advisory lock.

extern crate self as sea_tree;

pub mod cache;
pub mod closure_table;
pub mod config;
pub mod engine;
pub mod error;
pub mod location;
pub mod lock;
pub mod nested_sets;
pub mod query;
pub mod temporal;
pub mod traits;
pub mod uniqueness;

pub mod prelude {
    //! Convenient re-exports for consumers.
    pub use crate::closure_table::ClosureTableTree;
    pub use crate::config::{NodeRemoval, OrderTracking, TreeConfig, TreeOptions};
    pub use crate::engine::{Position, TreeEngine};
    pub use crate::error::TreeError;
    pub use crate::nested_sets::NestedSetsTree;
    pub use crate::query::{Criteria, QueryMode, Validity};
    pub use crate::temporal::{Historicize, TemporalTree};
    pub use crate::traits::{ClosureTableNode, NestedSetsNode, TreeNode};
    pub use crate::uniqueness::{UniqueConstraint, UniqueScope};
}

pub use sea_tree_macros::ClosureTableNode as ClosureTableNodeDerive;
#[doc(hidden)]
pub use sea_tree_macros::ClosureTableNode;
pub use sea_tree_macros::NestedSetsNode as NestedSetsNodeDerive;
#[doc(hidden)]
pub use sea_tree_macros::NestedSetsNode;

pub use cache::SubtreeCache;
pub use closure_table::{ClosureTableTree, NO_ORDER_INDEX};
pub use config::{
    AdvisoryLockKey, AdvisoryLockStrategy, NodeRemoval, OrderTracking, TreeConfig, TreeOptions,
};
pub use engine::{CopiedNodeRenamer, Position, TreeEngine};
pub use error::{TreeError, UniqueViolation};
pub use location::{Action, Location, Relation};
pub use lock::{MutationGuard, MutationLock};
pub use nested_sets::{NestedSetsTree, ROOT_LEFT};
pub use query::{Criteria, QueryMode, Validity};
pub use temporal::{Historicize, TemporalTree};
pub use traits::{ClosureTableNode, Column, NestedSetsNode, PathColumn, TreeNode};
pub use uniqueness::{UniqueConstraint, UniqueScope, UniquenessScope};

#[doc(hidden)]
pub mod __private {
    pub use once_cell::sync::Lazy;
}
