use mxsync::{ExplorerError, ModelExplorer};
use mxsync_test_utils::{
    cells, init_test_logging, sample_model, space, RecordingObserver, RpcHarness, MODEL_CHANGED,
};
use mxsync_tree::{DiffError, Node, SyncError};
use pretty_assertions::assert_eq;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn renamed_model() -> Node {
    let mut model = sample_model();
    model.children[0] = model.children[0].clone().with_attr("name", "Renamed");
    model.children[0].children[1].children.push(cells(31));
    model
}

#[tokio::test]
async fn test_refresh_loads_model() {
    init_test_logging();
    let (correlator, worker) = RpcHarness::new().into_worker(sample_model());
    let mut explorer = ModelExplorer::new(correlator, RecordingObserver::new());

    assert_eq!(explorer.refresh().await.unwrap(), 1);
    assert_eq!(explorer.root(), Some(&sample_model()));

    // Nothing changed on the worker side
    assert_eq!(explorer.refresh().await.unwrap(), 0);
    assert_eq!(worker.snapshots_served(), 2);
    worker.shutdown().await;
}

#[tokio::test]
async fn test_refresh_applies_incremental_edits() {
    let (correlator, worker) = RpcHarness::new().into_worker(sample_model());
    let mut explorer = ModelExplorer::new(correlator, RecordingObserver::new());
    explorer.refresh().await.unwrap();
    explorer.tree_mut().observer_mut().clear();

    worker.set_model(renamed_model());
    assert_eq!(explorer.refresh().await.unwrap(), 2);
    assert_eq!(explorer.root(), Some(&renamed_model()));

    let observer = explorer.tree().observer();
    observer.assert_paired();
    assert_eq!(observer.structural_counts(), (1, 0, 0));
    worker.shutdown().await;
}

#[tokio::test]
async fn test_failed_refresh_keeps_tree() {
    let (correlator, worker) = RpcHarness::new().into_worker(sample_model());
    let mut explorer = ModelExplorer::new(correlator, RecordingObserver::new());
    explorer.refresh().await.unwrap();

    let mut broken = sample_model();
    broken.children.push(space(2, []));
    worker.set_model(broken);

    let err = explorer.refresh().await.unwrap_err();
    assert!(matches!(
        err,
        ExplorerError::Sync(SyncError::Diff(DiffError::DuplicateId { .. }))
    ));
    assert_eq!(explorer.root(), Some(&sample_model()));
    worker.shutdown().await;
}

#[tokio::test]
async fn test_refresh_on_next_notification() {
    let (correlator, worker) = RpcHarness::new().into_worker(sample_model());
    let mut explorer = ModelExplorer::new(correlator.clone(), RecordingObserver::new());
    explorer.refresh().await.unwrap();

    let task = tokio::spawn(async move {
        let applied = explorer.refresh_on_next(MODEL_CHANGED, WAIT).await;
        (explorer, applied)
    });
    while correlator.subscriber_count(MODEL_CHANGED) == 0 {
        tokio::task::yield_now().await;
    }
    worker.publish(renamed_model()).await.unwrap();

    let (explorer, applied) = task.await.unwrap();
    assert_eq!(applied.unwrap(), 2);
    assert_eq!(explorer.root(), Some(&renamed_model()));
    worker.shutdown().await;
}

#[tokio::test]
async fn test_watch_follows_pushed_changes() {
    let (correlator, worker) = RpcHarness::new().into_worker(sample_model());
    let mut explorer = ModelExplorer::new(correlator.clone(), RecordingObserver::new());
    let (subscription, signals) = explorer.watch(MODEL_CHANGED);

    let task = tokio::spawn(async move {
        let refreshed = explorer.run_until_closed(signals).await;
        (explorer, refreshed)
    });

    worker.notify().await.unwrap();
    while worker.snapshots_served() < 1 {
        tokio::task::yield_now().await;
    }
    worker.publish(renamed_model()).await.unwrap();
    while worker.snapshots_served() < 2 {
        tokio::task::yield_now().await;
    }

    // Removing the subscription closes the signal channel
    assert!(correlator.unsubscribe(subscription));
    let (explorer, refreshed) = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();

    assert_eq!(refreshed, 2);
    assert_eq!(explorer.root(), Some(&renamed_model()));
    worker.shutdown().await;
}

#[tokio::test]
async fn test_call_uses_worker() {
    let (correlator, worker) = RpcHarness::new().into_worker(sample_model());
    let explorer = ModelExplorer::new(correlator, ());

    let value: Vec<u32> = explorer.call("echo", &[1, 2, 3]).await.unwrap();
    assert_eq!(value, vec![1, 2, 3]);
    worker.shutdown().await;
}
