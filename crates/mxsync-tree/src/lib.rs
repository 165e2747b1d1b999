//! Tree model, diffing and live synchronization for mxsync
//!
//! Decodes worker snapshots into typed trees, computes ordered edit lists
//! between two snapshots, and applies them to a displayed tree while
//! notifying an observer.

pub mod node;
pub mod snapshot;
pub mod diff;
pub mod sync;

pub use node::{Attributes, Node, NodeId, NodeKind, TreePath};
pub use snapshot::{Snapshot, SnapshotError, ITEM_SPACES_LABEL};
pub use diff::{diff, DiffError, Edit};
pub use sync::{SyncError, TreeObserver, TreeSync};
