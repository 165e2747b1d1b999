pub mod fixtures;
pub mod harness;
pub mod observer;

pub use fixtures::{cells, container, item_spaces, reference, sample_model, space, to_wire, SnapshotFiles};
pub use harness::{RpcHarness, SnapshotWorker, MODEL_CHANGED};
pub use observer::{ObserverEvent, RecordingObserver};

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("mxsync=debug,mxsync_rpc=debug,mxsync_tree=debug")),
            )
            .with_test_writer()
            .init();
    });
}
