use crate::traits::TreeNode;

/// Kind of structural action a [`Location`] describes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Action {
    Insert,
    Update,
    Copy,
    Move,
}

/// How the related node of a [`Location`] relates to the target position.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Relation {
    Parent,
    Sibling,
}

/// Where a pending insert, update, move or copy lands.
///
/// `root` is the root of the destination tree, absent when the action
/// creates or targets a root. The related node is the destination parent or
/// sibling; for updates it is the node being updated and carries no relation.
#[derive(Clone, Debug)]
pub struct Location<M: TreeNode> {
    root: Option<M>,
    related: Option<M>,
    relation: Option<Relation>,
    action: Action,
}

impl<M: TreeNode> Location<M> {
    pub fn new(root: Option<M>, related: Option<M>, relation: Option<Relation>, action: Action) -> Self {
        Self {
            root,
            related,
            relation,
            action,
        }
    }

    /// Location of a new root.
    pub fn root_level(action: Action) -> Self {
        Self::new(None, None, None, action)
    }

    /// Location below `parent` inside the tree rooted at `root`.
    pub fn under(root: Option<M>, parent: M, action: Action) -> Self {
        Self::new(root, Some(parent), Some(Relation::Parent), action)
    }

    /// Location next to `sibling` inside the tree rooted at `root`.
    pub fn beside(root: Option<M>, sibling: M, action: Action) -> Self {
        Self::new(root, Some(sibling), Some(Relation::Sibling), action)
    }

    /// Location of an update of `existing` inside the tree rooted at `root`.
    pub fn update_of(root: Option<M>, existing: Option<M>) -> Self {
        Self::new(root, existing, None, Action::Update)
    }

    pub fn root(&self) -> Option<&M> {
        self.root.as_ref()
    }

    pub fn related(&self) -> Option<&M> {
        self.related.as_ref()
    }

    pub fn relation(&self) -> Option<Relation> {
        self.relation
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// The parent the action targets directly, if the related node is one.
    pub fn parent(&self) -> Option<&M> {
        match self.relation {
            Some(Relation::Parent) => self.related.as_ref(),
            _ => None,
        }
    }

    /// Whether a candidate with identity `candidate` is checked among roots:
    /// there is no destination root, or the candidate is that root.
    pub fn is_root_check(&self, candidate: Option<&M::Id>) -> bool {
        match (&self.root, candidate) {
            (None, _) => true,
            (Some(root), Some(id)) => &root.id() == id,
            (Some(_), None) => false,
        }
    }

    /// Identity of the existing row an updated or moved candidate replaces.
    pub(crate) fn existing_id(&self) -> Option<M::Id> {
        match self.action {
            Action::Update => self.related.as_ref().map(TreeNode::id),
            _ => None,
        }
    }
}
