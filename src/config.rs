use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::TreeError;

/// Static configuration describing how a SeaORM model is indexed as a tree.
#[derive(Clone, Debug)]
pub struct TreeConfig {
    entity_name: String,
    path_entity_name: Option<String>,
    order_tracking: OrderTracking,
    node_removal: NodeRemoval,
    check_unique_on_update: bool,
    advisory_lock_strategy: AdvisoryLockStrategy,
}

impl TreeConfig {
    /// Create a new configuration for the logical entity name.
    pub fn new(entity_name: impl Into<String>) -> Self {
        let entity_name = entity_name.into();
        let default_lock =
            AdvisoryLockStrategy::Namespaced(AdvisoryLockKey::derived_from(&entity_name, None));

        Self {
            entity_name,
            path_entity_name: None,
            order_tracking: OrderTracking::default(),
            node_removal: NodeRemoval::default(),
            check_unique_on_update: false,
            advisory_lock_strategy: default_lock,
        }
    }

    /// Merge options produced by [`TreeOptions`].
    pub(crate) fn apply_options(mut self, options: TreeOptions) -> Self {
        if let Some(path_entity_name) = options.path_entity_name {
            if matches!(self.advisory_lock_strategy, AdvisoryLockStrategy::Namespaced(_)) {
                self.advisory_lock_strategy = AdvisoryLockStrategy::Namespaced(
                    AdvisoryLockKey::derived_from(&self.entity_name, Some(&path_entity_name)),
                );
            }
            self.path_entity_name = Some(path_entity_name);
        }
        if let Some(order_tracking) = options.order_tracking {
            self.order_tracking = order_tracking;
        }
        if let Some(node_removal) = options.node_removal {
            self.node_removal = node_removal;
        }
        if let Some(check) = options.check_unique_on_update {
            self.check_unique_on_update = check;
        }
        if let Some(strategy) = options.advisory_lock {
            self.advisory_lock_strategy = strategy;
        }
        self
    }

    /// Rust struct name of the node entity.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Name of the closure-table path entity, if any.
    pub fn path_entity_name(&self) -> Option<&str> {
        self.path_entity_name.as_deref()
    }

    pub fn order_tracking(&self) -> OrderTracking {
        self.order_tracking
    }

    pub fn node_removal(&self) -> NodeRemoval {
        self.node_removal
    }

    /// Whether `update` evaluates the uniqueness constraint itself.
    pub fn check_unique_on_update(&self) -> bool {
        self.check_unique_on_update
    }

    /// Advisory lock strategy (PostgreSQL only).
    pub fn advisory_lock_strategy(&self) -> &AdvisoryLockStrategy {
        &self.advisory_lock_strategy
    }
}

/// Builder-style overrides, consumed by the derive macro and by engine constructors.
///
/// Deserializable so the same settings can live in application configuration:
///
/// ```
/// let options = sea_tree::TreeOptions::from_json(r#"{ "order_tracking": "untracked" }"#).unwrap();
/// assert_eq!(options, sea_tree::TreeOptions::default().order_tracking(sea_tree::OrderTracking::Untracked));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TreeOptions {
    path_entity_name: Option<String>,
    order_tracking: Option<OrderTracking>,
    node_removal: Option<NodeRemoval>,
    check_unique_on_update: Option<bool>,
    advisory_lock: Option<AdvisoryLockStrategy>,
}

impl TreeOptions {
    pub fn from_json(source: &str) -> Result<Self, TreeError> {
        serde_json::from_str(source).map_err(|err| TreeError::configuration(err.to_string()))
    }

    pub fn path_entity_name(mut self, value: impl Into<String>) -> Self {
        self.path_entity_name = Some(value.into());
        self
    }

    pub fn order_tracking(mut self, tracking: OrderTracking) -> Self {
        self.order_tracking = Some(tracking);
        self
    }

    pub fn node_removal(mut self, removal: NodeRemoval) -> Self {
        self.node_removal = Some(removal);
        self
    }

    pub fn check_unique_on_update(mut self, check: bool) -> Self {
        self.check_unique_on_update = Some(check);
        self
    }

    pub fn advisory_lock(mut self, strategy: AdvisoryLockStrategy) -> Self {
        self.advisory_lock = Some(strategy);
        self
    }

    pub fn apply(self, base: TreeConfig) -> TreeConfig {
        base.apply_options(self)
    }
}

/// Whether closure-table sibling positions are maintained in `order_index`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderTracking {
    #[default]
    Tracked,
    Untracked,
}

/// What happens to closure-table node rows when their paths are removed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRemoval {
    /// Only the path rows go; the node table may be shared by several trees.
    #[default]
    KeepNodes,
    DeleteNodes,
}

/// Key used for PostgreSQL advisory locks.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdvisoryLockKey(String);

impl AdvisoryLockKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    fn derived_from(entity: &str, path_entity: Option<&str>) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(entity.as_bytes());
        if let Some(path_entity) = path_entity {
            hasher.update(b"/");
            hasher.update(path_entity.as_bytes());
        }
        let crc = hasher.finalize();
        match path_entity {
            Some(path_entity) => Self(format!("sea-tree::{entity}::{path_entity}::{crc:x}")),
            None => Self(format!("sea-tree::{entity}::{crc:x}")),
        }
    }
}

/// Configuration describing how to acquire advisory locks.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryLockStrategy {
    Disabled,
    Namespaced(AdvisoryLockKey),
}

impl AdvisoryLockStrategy {
    pub fn key(&self) -> Option<&AdvisoryLockKey> {
        match self {
            AdvisoryLockStrategy::Disabled => None,
            AdvisoryLockStrategy::Namespaced(key) => Some(key),
        }
    }
}
