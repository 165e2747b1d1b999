//! Tree diffing for incremental view updates
//!
//! Turns two snapshots of the same object graph into an ordered list of
//! [`Edit`]s. Applying the edits in order to a live copy of the old tree
//! yields the new tree while keeping every surviving node in place, so a
//! view bound to the live tree keeps its selection and expansion state.
//!
//! Per matched pair of nodes the edits are emitted as: attribute update,
//! removals (descending index runs), insertions (ascending index runs),
//! moves, then the same for each surviving child in its new position.

use crate::node::{Attributes, Node, NodeId, NodeKind, TreePath};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::trace;

/// One atomic change reconciling a live tree with a newer snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Edit {
    /// Replace the attribute map of the node at `path`
    Update { path: TreePath, attributes: Attributes },

    /// Remove `count` children of `parent` starting at `start`
    Remove {
        parent: TreePath,
        start: usize,
        count: usize,
    },

    /// Insert `nodes` as children of `parent` starting at `start`
    Insert {
        parent: TreePath,
        start: usize,
        nodes: Vec<Node>,
    },

    /// Move `count` children of `parent` from `from` so that the block
    /// starts at `to` once moved
    Move {
        parent: TreePath,
        from: usize,
        to: usize,
        count: usize,
    },
}

impl Edit {
    /// Path of the node whose children (or attributes, for updates) change
    pub fn target(&self) -> &TreePath {
        match self {
            Edit::Update { path, .. } => path,
            Edit::Remove { parent, .. } | Edit::Insert { parent, .. } | Edit::Move { parent, .. } => {
                parent
            }
        }
    }

    pub fn is_structural(&self) -> bool {
        !matches!(self, Edit::Update { .. })
    }
}

impl fmt::Display for Edit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edit::Update { path, attributes } => {
                write!(f, "update {path} ({} attributes)", attributes.len())
            }
            Edit::Remove {
                parent,
                start,
                count,
            } => write!(f, "remove {parent} [{start}..{})", start + count),
            Edit::Insert {
                parent,
                start,
                nodes,
            } => {
                write!(f, "insert {parent} @{start}:")?;
                for node in nodes {
                    write!(f, " {}({})", node.kind, node.id)?;
                }
                Ok(())
            }
            Edit::Move {
                parent,
                from,
                to,
                count,
            } => write!(f, "move {parent} [{from}..{}) -> {to}", from + count),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiffError {
    #[error("Diff precondition violated under {parent}: {id} missing from remaining order")]
    Precondition { parent: TreePath, id: NodeId },

    #[error("Duplicate sibling {kind} {id} under {parent}")]
    DuplicateId {
        parent: TreePath,
        id: NodeId,
        kind: NodeKind,
    },
}

type Key = (NodeId, NodeKind);

/// Compute the edits turning `old` into `new`
///
/// With no old tree the whole of `new` is inserted at the top level. A root
/// of a different identity replaces the old root outright.
pub fn diff(old: Option<&Node>, new: &Node) -> Result<Vec<Edit>, DiffError> {
    let mut edits = Vec::new();
    match old {
        None => edits.push(Edit::Insert {
            parent: TreePath::top(),
            start: 0,
            nodes: vec![new.clone()],
        }),
        Some(old) if !old.same_identity(new) => {
            edits.push(Edit::Remove {
                parent: TreePath::top(),
                start: 0,
                count: 1,
            });
            edits.push(Edit::Insert {
                parent: TreePath::top(),
                start: 0,
                nodes: vec![new.clone()],
            });
        }
        Some(old) => diff_node(old, new, &TreePath::root(), &mut edits)?,
    }
    trace!("Diff produced {} edits", edits.len());
    Ok(edits)
}

fn diff_node(old: &Node, new: &Node, path: &TreePath, edits: &mut Vec<Edit>) -> Result<(), DiffError> {
    if old.attributes != new.attributes {
        edits.push(Edit::Update {
            path: path.clone(),
            attributes: new.attributes.clone(),
        });
    }

    let old_keys: Vec<Key> = old.children.iter().map(Node::key).collect();
    let new_keys: Vec<Key> = new.children.iter().map(Node::key).collect();
    let old_index = index_keys(&old_keys, path)?;
    let new_index = index_keys(&new_keys, path)?;

    // Removals, highest run first so lower indices stay valid
    let removed: Vec<usize> = old_keys
        .iter()
        .enumerate()
        .filter(|(_, key)| !new_index.contains_key(*key))
        .map(|(i, _)| i)
        .collect();
    for (start, count) in runs(&removed).into_iter().rev() {
        edits.push(Edit::Remove {
            parent: path.clone(),
            start,
            count,
        });
    }
    let mut current: Vec<Key> = old_keys
        .into_iter()
        .filter(|key| new_index.contains_key(key))
        .collect();

    // Insertions at their final indices, lowest run first
    let added: Vec<usize> = new_keys
        .iter()
        .enumerate()
        .filter(|(_, key)| !old_index.contains_key(*key))
        .map(|(i, _)| i)
        .collect();
    for (start, count) in runs(&added) {
        edits.push(Edit::Insert {
            parent: path.clone(),
            start,
            nodes: new.children[start..start + count].to_vec(),
        });
        current.splice(start..start, new_keys[start..start + count].iter().copied());
    }

    reorder(&mut current, &new_keys, path, edits)?;

    for (index, child) in new.children.iter().enumerate() {
        if let Some(&old_pos) = old_index.get(&child.key()) {
            diff_node(&old.children[old_pos], child, &path.child(index), edits)?;
        }
    }

    Ok(())
}

/// Emit moves until `current` matches `target`
///
/// Scans left to right. At the first mismatch the expected node is looked up
/// further right, the block starting there is extended while it keeps
/// matching the target order, and the whole block is moved into place.
fn reorder(
    current: &mut Vec<Key>,
    target: &[Key],
    parent: &TreePath,
    edits: &mut Vec<Edit>,
) -> Result<(), DiffError> {
    let mut i = 0;
    while i < target.len() {
        let expected = target[i];
        if current.get(i) == Some(&expected) {
            i += 1;
            continue;
        }

        let from = current
            .iter()
            .skip(i + 1)
            .position(|key| *key == expected)
            .map(|offset| offset + i + 1)
            .ok_or_else(|| DiffError::Precondition {
                parent: parent.clone(),
                id: expected.0,
            })?;

        let mut count = 1;
        while from + count < current.len()
            && i + count < target.len()
            && current[from + count] == target[i + count]
        {
            count += 1;
        }

        edits.push(Edit::Move {
            parent: parent.clone(),
            from,
            to: i,
            count,
        });
        let block: Vec<Key> = current.drain(from..from + count).collect();
        current.splice(i..i, block);
        i += count;
    }
    Ok(())
}

fn index_keys(keys: &[Key], parent: &TreePath) -> Result<HashMap<Key, usize>, DiffError> {
    let mut index = HashMap::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        if index.insert(*key, i).is_some() {
            return Err(DiffError::DuplicateId {
                parent: parent.clone(),
                id: key.0,
                kind: key.1,
            });
        }
    }
    Ok(index)
}

/// Group sorted indices into maximal `(start, count)` runs
fn runs(indices: &[usize]) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for &index in indices {
        match runs.last_mut() {
            Some((start, count)) if *start + *count == index => *count += 1,
            _ => runs.push((index, 1)),
        }
    }
    runs
}
