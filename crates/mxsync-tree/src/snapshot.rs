//! Decoding of wire snapshots into [`Node`] trees
//!
//! The worker reports its object graph as nested JSON records tagged by
//! `kind`. Each kind has fixed named child collections which are flattened
//! here into the presentation order of the view:
//!
//! | kind      | children                                            |
//! |-----------|-----------------------------------------------------|
//! | Container | spaces, refs                                        |
//! | Space     | item-space group (if any), spaces, cells, refs      |
//! | Cells     | none                                                |
//! | Reference | none                                                |

use crate::node::{Attributes, Node, NodeId, NodeKind};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Label carried by the synthetic item-space group node
pub const ITEM_SPACES_LABEL: &str = "[ItemSpaces]";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unexpected {found} record {id} in `{collection}` of {parent}")]
    UnexpectedKind {
        parent: u64,
        collection: &'static str,
        id: u64,
        found: NodeKind,
    },
}

/// Raw wire record, internally tagged by `kind`
#[derive(Deserialize, Debug)]
#[serde(tag = "kind")]
enum WireNode {
    Container {
        id: u64,
        #[serde(default)]
        attrs: Attributes,
        #[serde(default)]
        spaces: Vec<WireNode>,
        #[serde(default)]
        refs: Vec<WireNode>,
    },
    Space {
        id: u64,
        #[serde(default)]
        attrs: Attributes,
        #[serde(default)]
        itemspaces: Vec<WireNode>,
        #[serde(default)]
        spaces: Vec<WireNode>,
        #[serde(default)]
        cells: Vec<WireNode>,
        #[serde(default)]
        refs: Vec<WireNode>,
    },
    Cells {
        id: u64,
        #[serde(default)]
        attrs: Attributes,
    },
    Reference {
        id: u64,
        #[serde(default)]
        attrs: Attributes,
    },
}

impl WireNode {
    fn id(&self) -> u64 {
        match self {
            WireNode::Container { id, .. }
            | WireNode::Space { id, .. }
            | WireNode::Cells { id, .. }
            | WireNode::Reference { id, .. } => *id,
        }
    }

    fn kind(&self) -> NodeKind {
        match self {
            WireNode::Container { .. } => NodeKind::Container,
            WireNode::Space { .. } => NodeKind::Space,
            WireNode::Cells { .. } => NodeKind::Cells,
            WireNode::Reference { .. } => NodeKind::Reference,
        }
    }
}

/// Entry points for turning wire bytes into a typed tree
pub struct Snapshot;

impl Snapshot {
    /// Decode a snapshot from raw JSON bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Node, SnapshotError> {
        let wire: WireNode = serde_json::from_slice(bytes)?;
        convert(wire)
    }

    /// Decode a snapshot from a JSON string
    pub fn from_str(text: &str) -> Result<Node, SnapshotError> {
        let wire: WireNode = serde_json::from_str(text)?;
        convert(wire)
    }

    /// Decode a snapshot from an already parsed JSON value
    pub fn from_value(value: serde_json::Value) -> Result<Node, SnapshotError> {
        let wire: WireNode = serde_json::from_value(value)?;
        convert(wire)
    }
}

fn convert(wire: WireNode) -> Result<Node, SnapshotError> {
    let node = match wire {
        WireNode::Container {
            id,
            attrs,
            spaces,
            refs,
        } => {
            let mut children = collect(id, "spaces", NodeKind::Space, spaces)?;
            children.extend(collect(id, "refs", NodeKind::Reference, refs)?);
            Node {
                id: NodeId::Entity(id),
                kind: NodeKind::Container,
                attributes: attrs,
                children,
            }
        }
        WireNode::Space {
            id,
            attrs,
            itemspaces,
            spaces,
            cells,
            refs,
        } => {
            let mut children = Vec::new();
            if !itemspaces.is_empty() {
                children.push(Node {
                    id: NodeId::ItemSpaces(id),
                    kind: NodeKind::ItemSpaceGroup,
                    attributes: Attributes::from([(
                        "name".to_string(),
                        serde_json::Value::from(ITEM_SPACES_LABEL),
                    )]),
                    children: collect(id, "itemspaces", NodeKind::Space, itemspaces)?,
                });
            }
            children.extend(collect(id, "spaces", NodeKind::Space, spaces)?);
            children.extend(collect(id, "cells", NodeKind::Cells, cells)?);
            children.extend(collect(id, "refs", NodeKind::Reference, refs)?);
            Node {
                id: NodeId::Entity(id),
                kind: NodeKind::Space,
                attributes: attrs,
                children,
            }
        }
        WireNode::Cells { id, attrs } => Node {
            id: NodeId::Entity(id),
            kind: NodeKind::Cells,
            attributes: attrs,
            children: Vec::new(),
        },
        WireNode::Reference { id, attrs } => Node {
            id: NodeId::Entity(id),
            kind: NodeKind::Reference,
            attributes: attrs,
            children: Vec::new(),
        },
    };
    Ok(node)
}

fn collect(
    parent: u64,
    collection: &'static str,
    expected: NodeKind,
    records: Vec<WireNode>,
) -> Result<Vec<Node>, SnapshotError> {
    records
        .into_iter()
        .map(|record| {
            if record.kind() != expected {
                debug!("Rejecting {} {} in {parent}.{collection}", record.kind(), record.id());
                return Err(SnapshotError::UnexpectedKind {
                    parent,
                    collection,
                    id: record.id(),
                    found: record.kind(),
                });
            }
            convert(record)
        })
        .collect()
}
