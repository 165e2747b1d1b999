use anyhow::Result;
use mxsync_tree::{Node, NodeId, NodeKind, ITEM_SPACES_LABEL};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub fn container(id: u64, children: impl IntoIterator<Item = Node>) -> Node {
    Node::new(id, NodeKind::Container).with_children(children)
}

pub fn space(id: u64, children: impl IntoIterator<Item = Node>) -> Node {
    Node::new(id, NodeKind::Space).with_children(children)
}

/// Synthetic group for the dynamic item spaces of space `parent`
pub fn item_spaces(parent: u64, children: impl IntoIterator<Item = Node>) -> Node {
    Node::with_id(NodeId::ItemSpaces(parent), NodeKind::ItemSpaceGroup)
        .with_attr("name", ITEM_SPACES_LABEL)
        .with_children(children)
}

pub fn cells(id: u64) -> Node {
    Node::new(id, NodeKind::Cells)
}

pub fn reference(id: u64) -> Node {
    Node::new(id, NodeKind::Reference)
}

/// A small model touching every node kind
pub fn sample_model() -> Node {
    container(
        1,
        [
            space(
                2,
                [
                    item_spaces(2, [space(20, []).with_attr("name", "__Space1[1]")]),
                    space(3, [cells(30).with_attr("params", json!(["t"]))]),
                    cells(4).with_attr("formula", "lambda t: t"),
                    reference(5).with_attr("value", 42),
                ],
            )
            .with_attr("name", "Space1"),
            reference(6).with_attr("value", "np"),
        ],
    )
    .with_attr("name", "Model1")
}

/// Encode a tree in the worker's snapshot format
///
/// Inverse of `Snapshot::from_value` for trees that follow the per-kind
/// child ordering.
pub fn to_wire(node: &Node) -> Value {
    let id = match node.id {
        NodeId::Entity(id) | NodeId::ItemSpaces(id) => id,
    };
    let mut record = Map::new();
    record.insert("kind".into(), json!(node.kind.to_string()));
    record.insert("id".into(), json!(id));
    record.insert("attrs".into(), json!(node.attributes));

    let of_kind = |kind: NodeKind| -> Vec<Value> {
        node.children
            .iter()
            .filter(|child| child.kind == kind)
            .map(to_wire)
            .collect()
    };

    match node.kind {
        NodeKind::Container => {
            record.insert("spaces".into(), Value::Array(of_kind(NodeKind::Space)));
            record.insert("refs".into(), Value::Array(of_kind(NodeKind::Reference)));
        }
        NodeKind::Space => {
            let itemspaces: Vec<Value> = node
                .children
                .iter()
                .filter(|child| child.kind == NodeKind::ItemSpaceGroup)
                .flat_map(|group| group.children.iter().map(to_wire))
                .collect();
            record.insert("itemspaces".into(), Value::Array(itemspaces));
            record.insert("spaces".into(), Value::Array(of_kind(NodeKind::Space)));
            record.insert("cells".into(), Value::Array(of_kind(NodeKind::Cells)));
            record.insert("refs".into(), Value::Array(of_kind(NodeKind::Reference)));
        }
        NodeKind::ItemSpaceGroup | NodeKind::Cells | NodeKind::Reference => {}
    }

    Value::Object(record)
}

/// Snapshot files in a scratch directory
pub struct SnapshotFiles {
    temp_dir: TempDir,
}

impl SnapshotFiles {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp_dir: TempDir::new()?,
        })
    }

    /// Write a tree as a wire snapshot file
    pub fn write_tree(&self, name: &str, tree: &Node) -> Result<PathBuf> {
        self.write_raw(name, &serde_json::to_vec_pretty(&to_wire(tree))?)
    }

    pub fn write_raw(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}
