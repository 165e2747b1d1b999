//! Typed tree model for decoded snapshots
//!
//! A snapshot is a tree of identity-bearing nodes. Identity is the pair of
//! [`NodeId`] and [`NodeKind`]; attributes are compared separately to decide
//! whether an existing node needs an in-place update.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute map carried by every node
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Stable identity of a node across refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    /// An entity reported by the worker
    Entity(u64),
    /// The synthetic item-space group of the space with this id
    ItemSpaces(u64),
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Entity(id) => write!(f, "{id}"),
            NodeId::ItemSpaces(id) => write!(f, "{id}#itemspaces"),
        }
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        NodeId::Entity(id)
    }
}

/// Role of a node in the object graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Container,
    Space,
    ItemSpaceGroup,
    Cells,
    Reference,
}

impl NodeKind {
    /// Whether nodes of this kind can hold children
    pub fn is_leaf(self) -> bool {
        matches!(self, NodeKind::Cells | NodeKind::Reference)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Container => "Container",
            NodeKind::Space => "Space",
            NodeKind::ItemSpaceGroup => "ItemSpaceGroup",
            NodeKind::Cells => "Cells",
            NodeKind::Reference => "Reference",
        };
        f.write_str(name)
    }
}

/// One node of a decoded snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Node {
    /// Create an entity node without attributes or children
    pub fn new(id: u64, kind: NodeKind) -> Self {
        Self::with_id(NodeId::Entity(id), kind)
    }

    /// Create a node with an explicit identity
    pub fn with_id(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            attributes: Attributes::new(),
            children: Vec::new(),
        }
    }

    /// Builder: set one attribute
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Builder: append one child
    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    /// Builder: append several children
    pub fn with_children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        self.children.extend(children);
        self
    }

    /// Identity used when matching nodes between two snapshots
    pub fn key(&self) -> (NodeId, NodeKind) {
        (self.id, self.kind)
    }

    /// Same logical entity
    pub fn same_identity(&self, other: &Node) -> bool {
        self.key() == other.key()
    }

    /// Same entity and same attributes (children are not compared)
    pub fn same_content(&self, other: &Node) -> bool {
        self.same_identity(other) && self.attributes == other.attributes
    }

    /// Number of nodes in this subtree, including self
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(Node::subtree_len).sum::<usize>()
    }

    /// Node at a path relative to this node (empty path is self)
    pub fn get(&self, path: &[usize]) -> Option<&Node> {
        path.iter()
            .try_fold(self, |node, &index| node.children.get(index))
    }

    /// Mutable node at a path relative to this node
    pub fn get_mut(&mut self, path: &[usize]) -> Option<&mut Node> {
        path.iter()
            .try_fold(self, |node, &index| node.children.get_mut(index))
    }

    /// Relative path of the first node with the given id, in pre-order
    pub fn find(&self, id: NodeId) -> Option<Vec<usize>> {
        if self.id == id {
            return Some(Vec::new());
        }
        for (index, child) in self.children.iter().enumerate() {
            if let Some(mut rest) = child.find(id) {
                rest.insert(0, index);
                return Some(rest);
            }
        }
        None
    }

    /// Pre-order iterator yielding each node with its depth below self
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![(0, self)],
        }
    }
}

/// Pre-order traversal returned by [`Node::walk`]
pub struct Walk<'a> {
    stack: Vec<(usize, &'a Node)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (usize, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, node) = self.stack.pop()?;
        self.stack
            .extend(node.children.iter().rev().map(|child| (depth + 1, child)));
        Some((depth, node))
    }
}

/// Position of a node in a displayed tree
///
/// Indices run from the invisible top level: the empty path is the top level
/// itself, `[0]` is the snapshot root, `[0, i]` its i-th child.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreePath(Vec<usize>);

impl TreePath {
    /// The invisible top level
    pub fn top() -> Self {
        Self(Vec::new())
    }

    /// Path of the snapshot root
    pub fn root() -> Self {
        Self(vec![0])
    }

    /// Path of the child at `index` below this path
    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    /// Parent path, `None` for the top level
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.0.split_last()?;
        Some(Self(rest.to_vec()))
    }

    pub fn is_top(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }
}

impl From<Vec<usize>> for TreePath {
    fn from(indices: Vec<usize>) -> Self {
        Self(indices)
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/")?;
        for (i, index) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{index}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Node {
        Node::new(1, NodeKind::Container).with_child(
            Node::new(2, NodeKind::Space)
                .with_child(Node::new(10, NodeKind::Cells))
                .with_child(Node::new(11, NodeKind::Reference)),
        )
    }

    #[test]
    fn test_get_and_find() {
        let tree = sample();
        assert_eq!(tree.get(&[0, 1]).map(|n| n.id), Some(NodeId::Entity(11)));
        assert!(tree.get(&[0, 2]).is_none());
        assert_eq!(tree.find(NodeId::Entity(10)), Some(vec![0, 0]));
        assert_eq!(tree.find(NodeId::Entity(99)), None);
    }

    #[test]
    fn test_walk_is_preorder() {
        let ids: Vec<_> = sample().walk().map(|(d, n)| (d, n.id.to_string())).collect();
        assert_eq!(
            ids,
            vec![
                (0, "1".to_string()),
                (1, "2".to_string()),
                (2, "10".to_string()),
                (2, "11".to_string()),
            ]
        );
        assert_eq!(sample().subtree_len(), 4);
    }

    #[test]
    fn test_identity_vs_content() {
        let a = Node::new(10, NodeKind::Cells).with_attr("formula", "x + 1");
        let b = Node::new(10, NodeKind::Cells).with_attr("formula", "x + 2");
        let c = Node::new(10, NodeKind::Reference);

        assert!(a.same_identity(&b));
        assert!(!a.same_content(&b));
        assert!(!a.same_identity(&c));
    }

    #[test]
    fn test_tree_path() {
        let path = TreePath::root().child(3);
        assert_eq!(path.indices(), &[0, 3]);
        assert_eq!(path.parent(), Some(TreePath::root()));
        assert_eq!(TreePath::top().parent(), None);
        assert_eq!(path.to_string(), "/0/3");
    }
}
