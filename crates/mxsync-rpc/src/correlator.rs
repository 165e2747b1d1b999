//! Request/response correlation
//!
//! Every outgoing request gets a fresh correlation id and a pending record
//! holding a oneshot waiter. Incoming envelopes are matched back to their
//! record by id; envelopes that match no record are either push
//! notifications, routed to subscribers by kind, or stale responses, which
//! are dropped.
//!
//! The pending table and the subscriber table are only locked for lookups
//! and inserts. Waiters are resolved and handlers run with no lock held, so
//! a handler may issue requests or change subscriptions.

use crate::protocol::{Envelope, ERROR_KIND, NOTIFICATION_ID};
use crate::transport::Transport;
use crate::RpcError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Token linking a request to its response
pub type CorrelationId = u64;

/// Handle returned by [`Correlator::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Correlator settings
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Timeout used by [`Correlator::call_default`]
    pub default_timeout: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// An unsolicited message pushed by the worker
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: String,
    pub payload: Bytes,
}

impl Notification {
    /// Deserialize the JSON payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        serde_json::from_slice(&self.payload).map_err(|e| RpcError::DecodeError(e.to_string()))
    }
}

type Outcome = Result<serde_json::Value, RpcError>;
type Handler = Arc<dyn Fn(Notification) + Send + Sync>;

struct PendingRequest {
    kind: String,
    issued_at: Instant,
    waiter: oneshot::Sender<Outcome>,
}

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
}

/// Body of an `error` envelope
#[derive(Deserialize)]
struct RemoteFailure {
    message: String,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: CorrelatorConfig,
    next_id: AtomicU64,
    next_subscription: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
    subscribers: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl Inner {
    fn purge(&self, id: CorrelationId) -> bool {
        lock(&self.pending).remove(&id).is_some()
    }
}

/// Matches responses on a shared channel to the calls that asked for them
///
/// Cloning is cheap; clones share the same tables.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    /// Create a correlator sending through `transport`
    pub fn new(transport: Arc<dyn Transport>, config: CorrelatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                next_id: AtomicU64::new(NOTIFICATION_ID + 1),
                next_subscription: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.inner.config
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Send a request and register it as pending
    ///
    /// The returned ticket resolves once the matching response arrives.
    /// Dropping an unresolved ticket forgets the request.
    pub async fn issue<T>(&self, kind: &str, payload: &T) -> Result<Ticket, RpcError>
    where
        T: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(payload).map_err(|e| RpcError::EncodeError(e.to_string()))?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        // Registered before sending so an immediate response finds it
        lock(&self.inner.pending).insert(
            id,
            PendingRequest {
                kind: kind.to_string(),
                issued_at: Instant::now(),
                waiter: tx,
            },
        );
        let ticket = Ticket {
            id,
            kind: kind.to_string(),
            rx: Some(rx),
            inner: self.inner.clone(),
        };

        self.inner
            .transport
            .send(Envelope::request(kind, id, bytes))
            .await?;
        debug!("Issued {} request {}", kind, id);
        Ok(ticket)
    }

    /// Send a request and wait for its response
    pub async fn call<T, R>(&self, kind: &str, payload: &T, timeout: Duration) -> Result<R, RpcError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.issue(kind, payload).await?.wait(timeout).await
    }

    /// [`Correlator::call`] with the configured default timeout
    pub async fn call_default<T, R>(&self, kind: &str, payload: &T) -> Result<R, RpcError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call(kind, payload, self.inner.config.default_timeout).await
    }

    /// Blocking form of [`Correlator::call`] for threads outside the runtime
    ///
    /// Responses keep being delivered by the runtime's workers while the
    /// calling thread waits. Must not be called from within the runtime.
    pub fn call_blocking<T, R>(
        &self,
        handle: &tokio::runtime::Handle,
        kind: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        handle.block_on(self.call(kind, payload, timeout))
    }

    /// Register a handler for push notifications of `kind`
    pub fn subscribe<F>(&self, kind: &str, handler: F) -> SubscriptionId
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.subscribers)
            .entry(kind.to_string())
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });
        debug!("Subscribed {:?} to {}", id, kind);
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.inner.subscribers);
        let mut removed = false;
        subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|sub| sub.id != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    /// Number of handlers registered for `kind`
    pub fn subscriber_count(&self, kind: &str) -> usize {
        lock(&self.inner.subscribers).get(kind).map_or(0, Vec::len)
    }

    /// Wait for the next push notification of `kind`
    pub async fn next_notification(&self, kind: &str, timeout: Duration) -> Result<Notification, RpcError> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let id = self.subscribe(kind, move |notification| {
            if let Some(tx) = lock(&slot).take() {
                let _ = tx.send(notification);
            }
        });

        let result = tokio::time::timeout(timeout, rx).await;
        self.unsubscribe(id);

        match result {
            Ok(Ok(notification)) => Ok(notification),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => Err(RpcError::TimedOut {
                kind: kind.to_string(),
                correlation_id: NOTIFICATION_ID,
                timeout,
            }),
        }
    }

    /// Deliver one incoming envelope
    pub fn on_envelope(&self, envelope: Envelope) {
        self.on_response(envelope.correlation_id, &envelope.kind, &envelope.payload);
    }

    /// Route an incoming message to its waiter or subscribers
    ///
    /// A message whose kind disagrees with the pending request ends that
    /// request with a protocol mismatch; its payload is never decoded. Late
    /// responses to requests that already finished are dropped silently.
    pub fn on_response(&self, correlation_id: CorrelationId, kind: &str, payload: &[u8]) {
        let request = lock(&self.inner.pending).remove(&correlation_id);

        match request {
            Some(request) if request.kind == kind || kind == ERROR_KIND => {
                self.resolve(correlation_id, kind, payload, request)
            }
            Some(request) => {
                let mismatch = RpcError::ProtocolMismatch {
                    correlation_id,
                    expected: request.kind.clone(),
                    found: kind.to_string(),
                };
                warn!("Dropping response: {}", mismatch);
                if request.waiter.send(Err(mismatch)).is_err() {
                    debug!("Waiter for request {} is gone", correlation_id);
                }
            }
            None if self.is_stale(correlation_id) => {
                debug!("Dropping late {} response {}", kind, correlation_id);
            }
            None => self.notify(kind, payload),
        }
    }

    /// Drain `rx`, delivering every envelope, until the channel closes
    ///
    /// When it closes every still pending request fails with a transport
    /// error.
    pub fn spawn_dispatch(&self, mut rx: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
        let correlator = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                correlator.on_envelope(envelope);
            }
            info!("Incoming channel closed");
            correlator.fail_all("Incoming channel closed");
        })
    }

    /// Fail every pending request with a transport error
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(CorrelationId, PendingRequest)> = lock(&self.inner.pending).drain().collect();
        for (id, request) in drained {
            debug!("Failing {} request {}: {}", request.kind, id, reason);
            let _ = request
                .waiter
                .send(Err(RpcError::TransportError(reason.to_string())));
        }
    }

    fn resolve(&self, id: CorrelationId, kind: &str, payload: &[u8], request: PendingRequest) {
        let outcome: Outcome = if kind == ERROR_KIND && request.kind != ERROR_KIND {
            let message = serde_json::from_slice::<RemoteFailure>(payload)
                .map(|failure| failure.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(payload).into_owned());
            Err(RpcError::RemoteError(message))
        } else {
            serde_json::from_slice(payload).map_err(|e| RpcError::DecodeError(e.to_string()))
        };

        debug!(
            "Request {} ({}) completed in {:?}",
            id,
            request.kind,
            request.issued_at.elapsed()
        );
        if request.waiter.send(outcome).is_err() {
            debug!("Waiter for request {} is gone", id);
        }
    }

    fn notify(&self, kind: &str, payload: &[u8]) {
        let handlers: Vec<Handler> = lock(&self.inner.subscribers)
            .get(kind)
            .map(|subs| subs.iter().map(|sub| sub.handler.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!("Dropping unmatched {} message", kind);
            return;
        }

        let notification = Notification {
            kind: kind.to_string(),
            payload: Bytes::copy_from_slice(payload),
        };
        for handler in handlers {
            handler(notification.clone());
        }
    }

    /// Whether `id` belongs to a request this correlator issued earlier
    fn is_stale(&self, id: CorrelationId) -> bool {
        id != NOTIFICATION_ID && id < self.inner.next_id.load(Ordering::Relaxed)
    }
}

/// A request in flight
pub struct Ticket {
    id: CorrelationId,
    kind: String,
    rx: Option<oneshot::Receiver<Outcome>>,
    inner: Arc<Inner>,
}

impl Ticket {
    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Wait for the response, giving up after `timeout`
    ///
    /// On timeout the request is forgotten; a response arriving later is
    /// dropped.
    pub async fn wait<R: DeserializeOwned>(mut self, timeout: Duration) -> Result<R, RpcError> {
        let rx = self.rx.take().ok_or(RpcError::Closed)?;
        let value = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(RpcError::Closed),
            Err(_) => {
                self.inner.purge(self.id);
                debug!("Request {} ({}) timed out after {:?}", self.id, self.kind, timeout);
                return Err(RpcError::TimedOut {
                    kind: self.kind.clone(),
                    correlation_id: self.id,
                    timeout,
                });
            }
        };
        serde_json::from_value(value).map_err(|e| RpcError::DecodeError(e.to_string()))
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.rx.is_some() && self.inner.purge(self.id) {
            debug!("Abandoned request {} ({})", self.id, self.kind);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use serde_json::json;

    fn correlator() -> (Correlator, mpsc::Receiver<Envelope>) {
        let (transport, rx) = ChannelTransport::new(16);
        (Correlator::new(Arc::new(transport), CorrelatorConfig::default()), rx)
    }

    #[tokio::test]
    async fn test_issue_sends_and_registers() {
        let (correlator, mut outgoing) = correlator();
        let ticket = correlator.issue("evaluate", &json!({"expr": "1+1"})).await.unwrap();

        let sent = outgoing.recv().await.unwrap();
        assert_eq!(sent.kind, "evaluate");
        assert_eq!(sent.correlation_id, ticket.correlation_id());
        assert_eq!(correlator.pending_count(), 1);

        correlator.on_response(ticket.correlation_id(), "evaluate", b"2");
        let value: i64 = ticket.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, 2);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_kind_ends_the_request() {
        let (correlator, _outgoing) = correlator();
        let ticket = correlator.issue("evaluate", &()).await.unwrap();
        let id = ticket.correlation_id();

        correlator.on_response(id, "snapshot", b"\"wrong\"");
        assert_eq!(correlator.pending_count(), 0);

        // The right kind arriving afterwards is a late response
        correlator.on_response(id, "evaluate", b"\"right\"");
        let result: Result<String, _> = ticket.wait(Duration::from_secs(1)).await;
        match result {
            Err(RpcError::ProtocolMismatch {
                correlation_id,
                expected,
                found,
            }) => {
                assert_eq!(correlation_id, id);
                assert_eq!(expected, "evaluate");
                assert_eq!(found, "snapshot");
            }
            other => panic!("Expected protocol mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_decode_failure_fails_the_call() {
        let (correlator, _outgoing) = correlator();
        let ticket = correlator.issue("evaluate", &()).await.unwrap();
        correlator.on_response(ticket.correlation_id(), "evaluate", b"{not json");

        let result: Result<serde_json::Value, _> = ticket.wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RpcError::DecodeError(_))));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error() {
        let (correlator, _outgoing) = correlator();
        let ticket = correlator.issue("evaluate", &()).await.unwrap();
        correlator.on_response(
            ticket.correlation_id(),
            ERROR_KIND,
            br#"{"message": "NameError: x"}"#,
        );

        let result: Result<(), _> = ticket.wait(Duration::from_secs(1)).await;
        match result {
            Err(RpcError::RemoteError(message)) => assert_eq!(message, "NameError: x"),
            other => panic!("Expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_ticket_is_forgotten() {
        let (correlator, _outgoing) = correlator();
        let ticket = correlator.issue("evaluate", &()).await.unwrap();
        assert_eq!(correlator.pending_count(), 1);
        drop(ticket);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_leaves_nothing_pending() {
        let (correlator, outgoing) = correlator();
        drop(outgoing);
        let result = correlator.issue("evaluate", &()).await;
        assert!(matches!(result, Err(RpcError::TransportError(_))));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (correlator, _outgoing) = correlator();
        let id = correlator.subscribe("changed", |_| {});
        assert!(correlator.unsubscribe(id));
        assert!(!correlator.unsubscribe(id));
    }
}
