use std::collections::{HashMap, HashSet};

use crate::traits::TreeNode;

/// Direct-child link of a materialized subtree, in sibling order.
#[derive(Clone, Debug)]
pub(crate) struct Link<M: TreeNode> {
    pub parent: M::Id,
    pub child: M,
    /// Whether the link was valid when the cache was built.
    pub valid: bool,
}

/// Immutable depth-first materialization of a closure-table subtree.
///
/// Built once from the subtree's depth-1 paths; children and subtrees are
/// then answered without querying.
#[derive(Clone, Debug)]
pub struct SubtreeCache<M: TreeNode> {
    nodes: Vec<M>,
    positions: HashMap<M::Id, usize>,
    children: HashMap<M::Id, Vec<usize>>,
    valid: HashMap<M::Id, bool>,
}

impl<M: TreeNode> SubtreeCache<M> {
    pub(crate) fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            positions: HashMap::new(),
            children: HashMap::new(),
            valid: HashMap::new(),
        }
    }

    /// Links must arrive grouped by ancestor, each group in order-index order.
    pub(crate) fn build(root: M, root_valid: bool, links: Vec<Link<M>>) -> Self {
        let mut grouped: HashMap<M::Id, Vec<(M, bool)>> = HashMap::new();
        for link in links {
            grouped
                .entry(link.parent)
                .or_default()
                .push((link.child, link.valid));
        }

        let mut cache = Self::empty();
        let mut visited = HashSet::new();
        cache.push_depth_first(root, root_valid, &mut grouped, &mut visited);
        cache
    }

    fn push_depth_first(
        &mut self,
        node: M,
        valid: bool,
        grouped: &mut HashMap<M::Id, Vec<(M, bool)>>,
        visited: &mut HashSet<M::Id>,
    ) -> Option<usize> {
        let id = node.id();
        if !visited.insert(id.clone()) {
            tracing::warn!(node = ?id, "node reached twice while caching subtree");
            return None;
        }

        let position = self.nodes.len();
        self.nodes.push(node);
        self.positions.insert(id.clone(), position);
        self.valid.insert(id.clone(), valid);

        let mut child_positions = Vec::new();
        for (child, child_valid) in grouped.remove(&id).unwrap_or_default() {
            if let Some(child_position) = self.push_depth_first(child, child_valid, grouped, visited) {
                child_positions.push(child_position);
            }
        }
        self.children.insert(id, child_positions);
        Some(position)
    }

    pub fn root(&self) -> Option<&M> {
        self.nodes.first()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, M> {
        self.nodes.iter()
    }

    /// All cached nodes, depth-first, root first.
    pub fn as_slice(&self) -> &[M] {
        &self.nodes
    }

    pub fn into_vec(self) -> Vec<M> {
        self.nodes
    }

    pub fn contains(&self, node: &M) -> bool {
        self.positions.contains_key(&node.id())
    }

    /// Direct children of `parent`; empty when `parent` is not cached.
    pub fn children_of(&self, parent: &M) -> Vec<M> {
        self.children
            .get(&parent.id())
            .map(|positions| positions.iter().map(|&at| self.nodes[at].clone()).collect())
            .unwrap_or_default()
    }

    /// Direct children of `parent` whose linking path was valid at build time.
    pub fn valid_children_of(&self, parent: &M) -> Vec<M> {
        self.children_of(parent)
            .into_iter()
            .filter(|child| self.is_valid(child))
            .collect()
    }

    /// Whether the path introducing `node` was valid at build time.
    pub fn is_valid(&self, node: &M) -> bool {
        self.valid.get(&node.id()).copied().unwrap_or(false)
    }

    /// Subtree of `parent` as a cache of its own; `None` when `parent` is not cached.
    pub fn sub_tree(&self, parent: &M) -> Option<SubtreeCache<M>> {
        let start = *self.positions.get(&parent.id())?;
        let mut sub = Self::empty();
        self.copy_into(start, &mut sub);
        Some(sub)
    }

    fn copy_into(&self, at: usize, sub: &mut SubtreeCache<M>) {
        let node = &self.nodes[at];
        let id = node.id();
        sub.positions.insert(id.clone(), sub.nodes.len());
        sub.nodes.push(node.clone());
        sub.valid.insert(id.clone(), self.valid.get(&id).copied().unwrap_or(false));

        let mut child_positions = Vec::new();
        for &child in self.children.get(&id).map(Vec::as_slice).unwrap_or_default() {
            child_positions.push(sub.nodes.len());
            self.copy_into(child, sub);
        }
        sub.children.insert(id, child_positions);
    }
}

impl<'a, M: TreeNode> IntoIterator for &'a SubtreeCache<M> {
    type Item = &'a M;
    type IntoIter = std::slice::Iter<'a, M>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
