use crate::fixtures::to_wire;
use anyhow::{anyhow, Context, Result};
use mxsync_rpc::{ChannelTransport, Correlator, CorrelatorConfig, Envelope, ERROR_KIND};
use mxsync_tree::Node;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Notification kind the snapshot worker pushes after a model change
pub const MODEL_CHANGED: &str = "model_changed";

const REQUEST_WAIT: Duration = Duration::from_secs(5);

/// A correlator wired to in-memory channels standing in for the worker
///
/// Requests the correlator sends show up in [`RpcHarness::next_request`];
/// anything passed to `respond`/`push` is delivered through the
/// correlator's dispatch task.
pub struct RpcHarness {
    pub correlator: Correlator,
    requests: mpsc::Receiver<Envelope>,
    responses: mpsc::Sender<Envelope>,
    dispatch: JoinHandle<()>,
}

impl RpcHarness {
    pub fn new() -> Self {
        Self::with_config(CorrelatorConfig::default())
    }

    pub fn with_config(config: CorrelatorConfig) -> Self {
        let (transport, requests) = ChannelTransport::new(64);
        let (responses, incoming) = mpsc::channel(64);
        let correlator = Correlator::new(Arc::new(transport), config);
        let dispatch = correlator.spawn_dispatch(incoming);
        Self {
            correlator,
            requests,
            responses,
            dispatch,
        }
    }

    /// Next request the correlator sent
    pub async fn next_request(&mut self) -> Result<Envelope> {
        tokio::time::timeout(REQUEST_WAIT, self.requests.recv())
            .await
            .context("No request within timeout")?
            .ok_or_else(|| anyhow!("Request channel closed"))
    }

    /// Answer `request` with a JSON body
    pub async fn respond<T: Serialize + ?Sized>(&self, request: &Envelope, body: &T) -> Result<()> {
        self.respond_raw(request.correlation_id, &request.kind, serde_json::to_vec(body)?)
            .await
    }

    /// Deliver an arbitrary message as if the worker sent it
    pub async fn respond_raw(&self, correlation_id: u64, kind: &str, payload: Vec<u8>) -> Result<()> {
        self.responses
            .send(Envelope::request(kind, correlation_id, payload))
            .await
            .map_err(|_| anyhow!("Dispatch task is gone"))
    }

    /// Answer `request` with a worker-side failure
    pub async fn fail(&self, request: &Envelope, message: &str) -> Result<()> {
        let body = serde_json::json!({ "message": message });
        self.respond_raw(request.correlation_id, ERROR_KIND, serde_json::to_vec(&body)?)
            .await
    }

    /// Push a notification
    pub async fn push<T: Serialize + ?Sized>(&self, kind: &str, body: &T) -> Result<()> {
        self.responses
            .send(Envelope::notification(kind, serde_json::to_vec(body)?))
            .await
            .map_err(|_| anyhow!("Dispatch task is gone"))
    }

    /// Hand the worker side to a [`SnapshotWorker`] serving `model`
    pub fn into_worker(self, model: Node) -> (Correlator, SnapshotWorker) {
        let worker = SnapshotWorker::spawn(self.requests, self.responses, model);
        (self.correlator, worker)
    }

    /// Close the incoming channel and wait for the dispatch task to finish
    pub async fn close(self) -> Result<()> {
        drop(self.responses);
        self.dispatch.await.context("Dispatch task panicked")
    }
}

impl Default for RpcHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Fake worker answering `snapshot` requests from a shared model
pub struct SnapshotWorker {
    model: Arc<Mutex<Node>>,
    served: Arc<AtomicUsize>,
    responses: mpsc::Sender<Envelope>,
    task: JoinHandle<()>,
}

impl SnapshotWorker {
    pub fn spawn(
        mut requests: mpsc::Receiver<Envelope>,
        responses: mpsc::Sender<Envelope>,
        model: Node,
    ) -> Self {
        let model = Arc::new(Mutex::new(model));
        let served = Arc::new(AtomicUsize::new(0));

        let task = {
            let model = model.clone();
            let served = served.clone();
            let responses = responses.clone();
            tokio::spawn(async move {
                while let Some(request) = requests.recv().await {
                    let reply = match request.kind.as_str() {
                        "snapshot" => {
                            served.fetch_add(1, Ordering::SeqCst);
                            let wire = to_wire(&model.lock().unwrap());
                            Envelope::request("snapshot", request.correlation_id, wire.to_string().into_bytes())
                        }
                        "echo" => Envelope::request("echo", request.correlation_id, request.payload),
                        other => {
                            let body = serde_json::json!({ "message": format!("Unknown request {other}") });
                            Envelope::request(ERROR_KIND, request.correlation_id, body.to_string().into_bytes())
                        }
                    };
                    if responses.send(reply).await.is_err() {
                        break;
                    }
                }
            })
        };

        Self {
            model,
            served,
            responses,
            task,
        }
    }

    /// Number of `snapshot` requests answered so far
    pub fn snapshots_served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    /// Replace the model without telling anyone
    pub fn set_model(&self, model: Node) {
        *self.model.lock().unwrap() = model;
    }

    /// Replace the model and push a change notification
    pub async fn publish(&self, model: Node) -> Result<()> {
        self.set_model(model);
        self.notify().await
    }

    /// Push a change notification without touching the model
    pub async fn notify(&self) -> Result<()> {
        self.responses
            .send(Envelope::notification(MODEL_CHANGED, b"null".to_vec()))
            .await
            .map_err(|_| anyhow!("Dispatch task is gone"))
    }

    /// Stop serving and close the incoming channel
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
        drop(self.responses);
    }
}
