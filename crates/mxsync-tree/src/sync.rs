//! Live tree adapter
//!
//! Owns the tree currently shown by a view and applies edit lists to it,
//! bracketing every structural mutation with begin/end notifications on a
//! [`TreeObserver`]. Holds no rendering logic.

use crate::diff::{diff, DiffError, Edit};
use crate::node::{Node, TreePath};
use thiserror::Error;
use tracing::debug;

/// Receives structural change notifications from a [`TreeSync`]
///
/// Every `begin_*` call is followed by the mutation and then the matching
/// `end_*` call before the next edit is looked at. All methods default to
/// no-ops.
pub trait TreeObserver {
    fn begin_insert(&mut self, _parent: &TreePath, _start: usize, _count: usize) {}
    fn end_insert(&mut self, _parent: &TreePath, _start: usize, _count: usize) {}

    fn begin_remove(&mut self, _parent: &TreePath, _start: usize, _count: usize) {}
    fn end_remove(&mut self, _parent: &TreePath, _start: usize, _count: usize) {}

    fn begin_move(&mut self, _parent: &TreePath, _from: usize, _to: usize, _count: usize) {}
    fn end_move(&mut self, _parent: &TreePath, _from: usize, _to: usize, _count: usize) {}

    /// The attribute map of the node at `path` was replaced
    fn attributes_changed(&mut self, _path: &TreePath) {}
}

impl TreeObserver for () {}

impl<T: TreeObserver + ?Sized> TreeObserver for Box<T> {
    fn begin_insert(&mut self, parent: &TreePath, start: usize, count: usize) {
        (**self).begin_insert(parent, start, count)
    }
    fn end_insert(&mut self, parent: &TreePath, start: usize, count: usize) {
        (**self).end_insert(parent, start, count)
    }
    fn begin_remove(&mut self, parent: &TreePath, start: usize, count: usize) {
        (**self).begin_remove(parent, start, count)
    }
    fn end_remove(&mut self, parent: &TreePath, start: usize, count: usize) {
        (**self).end_remove(parent, start, count)
    }
    fn begin_move(&mut self, parent: &TreePath, from: usize, to: usize, count: usize) {
        (**self).begin_move(parent, from, to, count)
    }
    fn end_move(&mut self, parent: &TreePath, from: usize, to: usize, count: usize) {
        (**self).end_move(parent, from, to, count)
    }
    fn attributes_changed(&mut self, path: &TreePath) {
        (**self).attributes_changed(path)
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error("Invalid edit #{index} ({edit}): {reason}")]
    InvalidEdit {
        index: usize,
        edit: String,
        reason: String,
    },
}

/// The displayed tree plus the observer told about its changes
pub struct TreeSync<O> {
    /// Invisible top level holding zero or one root
    top: Vec<Node>,
    observer: O,
}

impl<O: TreeObserver> TreeSync<O> {
    /// Create an empty adapter
    pub fn new(observer: O) -> Self {
        Self {
            top: Vec::new(),
            observer,
        }
    }

    /// Currently displayed root, if any
    pub fn root(&self) -> Option<&Node> {
        self.top.first()
    }

    /// Node at a full path (starting at the top level)
    pub fn get(&self, path: &TreePath) -> Option<&Node> {
        let (first, rest) = path.indices().split_first()?;
        self.top.get(*first)?.get(rest)
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn into_observer(self) -> O {
        self.observer
    }

    /// Apply an edit list
    ///
    /// The list is checked against a scratch copy first; if any edit does not
    /// fit, nothing is applied and the observer hears nothing.
    pub fn apply(&mut self, edits: Vec<Edit>) -> Result<(), SyncError> {
        let mut scratch = self.top.clone();
        for (index, edit) in edits.iter().enumerate() {
            mutate(&mut scratch, edit, &mut ()).map_err(|reason| SyncError::InvalidEdit {
                index,
                edit: edit.to_string(),
                reason,
            })?;
        }
        self.apply_checked(&edits)
    }

    /// Reconcile the displayed tree with a new snapshot
    ///
    /// Returns the number of edits applied. A diff failure or an edit list
    /// that does not fit leaves the displayed tree untouched.
    pub fn sync_to(&mut self, new: &Node) -> Result<usize, SyncError> {
        let edits = diff(self.root(), new)?;
        let count = edits.len();
        self.apply(edits)?;
        Ok(count)
    }

    /// Remove the displayed root, if any
    pub fn clear(&mut self) {
        if self.top.is_empty() {
            return;
        }
        let top = TreePath::top();
        let count = self.top.len();
        self.observer.begin_remove(&top, 0, count);
        self.top.clear();
        self.observer.end_remove(&top, 0, count);
    }

    fn apply_checked(&mut self, edits: &[Edit]) -> Result<(), SyncError> {
        debug!("Applying {} edits", edits.len());
        for (index, edit) in edits.iter().enumerate() {
            mutate(&mut self.top, edit, &mut self.observer).map_err(|reason| {
                SyncError::InvalidEdit {
                    index,
                    edit: edit.to_string(),
                    reason,
                }
            })?;
        }
        Ok(())
    }
}

impl Default for TreeSync<()> {
    fn default() -> Self {
        Self::new(())
    }
}

fn mutate<O: TreeObserver + ?Sized>(
    top: &mut Vec<Node>,
    edit: &Edit,
    observer: &mut O,
) -> Result<(), String> {
    match edit {
        Edit::Update { path, attributes } => {
            let node = node_mut(top, path)?;
            node.attributes = attributes.clone();
            observer.attributes_changed(path);
        }
        Edit::Remove {
            parent,
            start,
            count,
        } => {
            let (start, count) = (*start, *count);
            let children = children_mut(top, parent)?;
            if count == 0 || start + count > children.len() {
                return Err(format!(
                    "range [{start}..{}) outside {} children",
                    start + count,
                    children.len()
                ));
            }
            observer.begin_remove(parent, start, count);
            children.drain(start..start + count);
            observer.end_remove(parent, start, count);
        }
        Edit::Insert {
            parent,
            start,
            nodes,
        } => {
            let start = *start;
            let count = nodes.len();
            if let Some(node) = parent_node(top, parent)? {
                if node.kind.is_leaf() {
                    return Err(format!("{} {} cannot hold children", node.kind, node.id));
                }
            }
            let children = children_mut(top, parent)?;
            if count == 0 || start > children.len() {
                return Err(format!(
                    "insert of {count} at {start} into {} children",
                    children.len()
                ));
            }
            if parent.is_top() && children.len() + count > 1 {
                return Err("the top level holds at most one root".to_string());
            }
            observer.begin_insert(parent, start, count);
            children.splice(start..start, nodes.iter().cloned());
            observer.end_insert(parent, start, count);
        }
        Edit::Move {
            parent,
            from,
            to,
            count,
        } => {
            let (from, to, count) = (*from, *to, *count);
            let children = children_mut(top, parent)?;
            let len = children.len();
            if count == 0 || from + count > len || to + count > len {
                return Err(format!(
                    "move of {count} from {from} to {to} within {len} children"
                ));
            }
            observer.begin_move(parent, from, to, count);
            let block: Vec<Node> = children.drain(from..from + count).collect();
            children.splice(to..to, block);
            observer.end_move(parent, from, to, count);
        }
    }
    Ok(())
}

fn node_mut<'a>(top: &'a mut [Node], path: &TreePath) -> Result<&'a mut Node, String> {
    let (first, rest) = path
        .indices()
        .split_first()
        .ok_or_else(|| "the top level has no attributes".to_string())?;
    top.get_mut(*first)
        .and_then(|root| root.get_mut(rest))
        .ok_or_else(|| format!("no node at {path}"))
}

fn parent_node<'a>(top: &'a [Node], path: &TreePath) -> Result<Option<&'a Node>, String> {
    let Some((first, rest)) = path.indices().split_first() else {
        return Ok(None);
    };
    top.get(*first)
        .and_then(|root| root.get(rest))
        .map(Some)
        .ok_or_else(|| format!("no node at {path}"))
}

fn children_mut<'a>(top: &'a mut Vec<Node>, path: &TreePath) -> Result<&'a mut Vec<Node>, String> {
    if path.is_top() {
        return Ok(top);
    }
    node_mut(top, path).map(|node| &mut node.children)
}
