use std::fmt;
use std::sync::Arc;

/// A process reference. `node` is `None` for "wherever this code runs";
/// two refs are equal iff both `id` and `node` match.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Ref {
    pub id: Arc<str>,
    pub node: Option<Arc<str>>,
}

impl Ref {
    pub fn local(id: impl Into<Arc<str>>) -> Self {
        Ref {
            id: id.into(),
            node: None,
        }
    }

    pub fn remote(id: impl Into<Arc<str>>, node: impl Into<Arc<str>>) -> Self {
        Ref {
            id: id.into(),
            node: Some(node.into()),
        }
    }

    pub fn is_local(&self) -> bool {
        self.node.is_none()
    }

    /// True when this ref names a process on `local_node` — a remote ref
    /// whose node string happens to equal our own canonical node id is
    /// treated as local for routing purposes (spec §4.11 step 2).
    pub fn resolves_local(&self, local_node: &str) -> bool {
        match &self.node {
            None => true,
            Some(node) => node.as_ref() == local_node,
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{}@{}", self.id, node),
            None => write!(f, "{}", self.id),
        }
    }
}
