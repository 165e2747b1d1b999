//! Keeps a displayed model tree in step with the worker
//!
//! Pulls full snapshots over the correlator and reconciles the displayed tree
//! through [`TreeSync`], either on demand or whenever the worker pushes a
//! change notification.

use mxsync_rpc::{Correlator, RpcError, SubscriptionId};
use mxsync_tree::{Node, Snapshot, SnapshotError, SyncError, TreeObserver, TreeSync};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Request kind answered with a full model snapshot
pub const SNAPSHOT_KIND: &str = "snapshot";

#[derive(Error, Debug)]
pub enum ExplorerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

pub struct ModelExplorer<O> {
    correlator: Correlator,
    sync: TreeSync<O>,
    subscriptions: Vec<SubscriptionId>,
}

impl<O: TreeObserver> ModelExplorer<O> {
    pub fn new(correlator: Correlator, observer: O) -> Self {
        Self {
            correlator,
            sync: TreeSync::new(observer),
            subscriptions: Vec::new(),
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// The displayed tree and its observer
    pub fn tree(&self) -> &TreeSync<O> {
        &self.sync
    }

    pub fn tree_mut(&mut self) -> &mut TreeSync<O> {
        &mut self.sync
    }

    pub fn root(&self) -> Option<&Node> {
        self.sync.root()
    }

    /// Fetch a snapshot and reconcile the displayed tree with it
    ///
    /// Returns the number of edits applied. On any failure the displayed
    /// tree is left as it was.
    pub async fn refresh(&mut self) -> Result<usize, ExplorerError> {
        let wire: serde_json::Value = self.correlator.call_default(SNAPSHOT_KIND, &()).await?;
        let snapshot = Snapshot::from_value(wire)?;
        let applied = self.sync.sync_to(&snapshot)?;
        debug!("Refresh applied {} edits", applied);
        Ok(applied)
    }

    /// Issue a request with the default timeout
    pub async fn call<T, R>(&self, kind: &str, payload: &T) -> Result<R, ExplorerError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        Ok(self.correlator.call_default(kind, payload).await?)
    }

    /// Subscribe to change notifications of `kind`
    ///
    /// The receiver yields one signal per notification, though bursts
    /// arriving before the previous signal was taken collapse into one.
    /// It closes once the subscription is removed.
    pub fn watch(&mut self, kind: &str) -> (SubscriptionId, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let id = self.correlator.subscribe(kind, move |_| {
            // Full means a signal is already waiting
            let _ = tx.try_send(());
        });
        self.subscriptions.push(id);
        info!("Watching {} notifications", kind);
        (id, rx)
    }

    /// Refresh on every signal until `signals` closes
    ///
    /// Signals queued while a refresh runs are folded into the next one.
    /// Failed refreshes are logged and do not end the loop. Returns the
    /// number of refreshes that succeeded.
    pub async fn run_until_closed(&mut self, mut signals: mpsc::Receiver<()>) -> usize {
        let mut refreshed = 0;
        while signals.recv().await.is_some() {
            while signals.try_recv().is_ok() {}
            match self.refresh().await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!("Refresh failed: {}", e),
            }
        }
        info!("Change signals closed after {} refreshes", refreshed);
        refreshed
    }

    /// Wait for one notification of `kind`, then refresh
    pub async fn refresh_on_next(&mut self, kind: &str, timeout: Duration) -> Result<usize, ExplorerError> {
        self.correlator.next_notification(kind, timeout).await?;
        self.refresh().await
    }
}

impl<O> Drop for ModelExplorer<O> {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.correlator.unsubscribe(id);
        }
    }
}
