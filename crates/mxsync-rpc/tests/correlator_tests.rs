use mxsync_rpc::{
    read_frames, Correlator, CorrelatorConfig, Envelope, FramedTransport, PayloadCompressor,
    RpcError, Transport,
};
use mxsync_test_utils::{init_test_logging, sample_model, RpcHarness, MODEL_CHANGED};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_reversed_delivery_reaches_each_caller() {
    init_test_logging();
    let mut harness = RpcHarness::new();

    let correlator = harness.correlator.clone();
    let call = |arg: &'static str| {
        let correlator = correlator.clone();
        tokio::spawn(async move { correlator.call::<_, String>("evaluate", &arg, WAIT).await })
    };
    let a = call("a");
    let first = harness.next_request().await.unwrap();
    let b = call("b");
    let second = harness.next_request().await.unwrap();
    assert_ne!(first.correlation_id, second.correlation_id);

    for request in [&second, &first] {
        let arg: String = serde_json::from_slice(&request.payload).unwrap();
        harness.respond(request, &format!("result-{arg}")).await.unwrap();
    }

    assert_eq!(a.await.unwrap().unwrap(), "result-a");
    assert_eq!(b.await.unwrap().unwrap(), "result-b");
    assert_eq!(harness.correlator.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_late_arrival_is_dropped() {
    let mut harness = RpcHarness::new();
    let seen = Arc::new(AtomicUsize::new(0));
    {
        let seen = seen.clone();
        harness.correlator.subscribe("evaluate", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    }

    let result: Result<i64, _> = harness
        .correlator
        .call("evaluate", &"slow()", Duration::from_secs(1))
        .await;
    match result {
        Err(RpcError::TimedOut { kind, timeout, .. }) => {
            assert_eq!(kind, "evaluate");
            assert_eq!(timeout, Duration::from_secs(1));
        }
        other => panic!("Expected timeout, got {other:?}"),
    }
    assert_eq!(harness.correlator.pending_count(), 0);

    let request = harness.next_request().await.unwrap();
    harness.respond(&request, &42).await.unwrap();

    // Closing waits for the dispatcher to process everything queued
    let correlator = harness.correlator.clone();
    harness.close().await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn test_mismatched_kind_never_reaches_the_caller() {
    let mut harness = RpcHarness::new();
    let correlator = harness.correlator.clone();
    let call = tokio::spawn(async move { correlator.call::<_, i64>("evaluate", &(), WAIT).await });

    let request = harness.next_request().await.unwrap();
    harness
        .respond_raw(request.correlation_id, "snapshot", b"1".to_vec())
        .await
        .unwrap();

    match call.await.unwrap() {
        Err(RpcError::ProtocolMismatch {
            correlation_id,
            expected,
            found,
        }) => {
            assert_eq!(correlation_id, request.correlation_id);
            assert_eq!(expected, "evaluate");
            assert_eq!(found, "snapshot");
        }
        other => panic!("Expected protocol mismatch, got {other:?}"),
    }
    assert_eq!(harness.correlator.pending_count(), 0);

    // A correctly typed answer arriving afterwards is dropped as late
    harness.respond(&request, &2).await.unwrap();
    assert_eq!(harness.correlator.pending_count(), 0);
}

#[tokio::test]
async fn test_push_reaches_subscribers() {
    let harness = RpcHarness::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        harness.correlator.subscribe(MODEL_CHANGED, move |notification| {
            let body: serde_json::Value = notification.decode().unwrap();
            received.lock().unwrap().push(body);
        });
    }

    harness.push(MODEL_CHANGED, &json!({"model": 1})).await.unwrap();
    harness.push("unrelated", &json!(null)).await.unwrap();
    harness.close().await.unwrap();

    assert_eq!(*received.lock().unwrap(), vec![json!({"model": 1})]);
}

#[tokio::test]
async fn test_handler_may_call_back_into_correlator() {
    let mut harness = RpcHarness::new();
    let correlator = harness.correlator.clone();
    let (done_tx, mut done_rx) = mpsc::channel(1);

    harness.correlator.subscribe(MODEL_CHANGED, move |_| {
        // Resubscribing from inside a handler must not deadlock
        let extra = correlator.subscribe(MODEL_CHANGED, |_| {});
        correlator.unsubscribe(extra);

        let correlator = correlator.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let value: i64 = correlator.call("evaluate", &"1+1", WAIT).await.unwrap();
            done_tx.send(value).await.unwrap();
        });
    });

    harness.push(MODEL_CHANGED, &()).await.unwrap();
    let request = harness.next_request().await.unwrap();
    assert_eq!(request.kind, "evaluate");
    harness.respond(&request, &2).await.unwrap();

    assert_eq!(done_rx.recv().await, Some(2));
}

#[tokio::test]
async fn test_next_notification() {
    let harness = RpcHarness::new();
    let correlator = harness.correlator.clone();
    let waiter = tokio::spawn(async move { correlator.next_notification(MODEL_CHANGED, WAIT).await });

    // Give the waiter a chance to subscribe
    while harness.correlator.subscriber_count(MODEL_CHANGED) == 0 {
        tokio::task::yield_now().await;
    }
    harness.push(MODEL_CHANGED, &"hello").await.unwrap();

    let notification = waiter.await.unwrap().unwrap();
    assert_eq!(notification.kind, MODEL_CHANGED);
    assert_eq!(notification.decode::<String>().unwrap(), "hello");
}

#[tokio::test(start_paused = true)]
async fn test_next_notification_times_out() {
    let harness = RpcHarness::new();
    let result = harness
        .correlator
        .next_notification(MODEL_CHANGED, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(RpcError::TimedOut { .. })));
}

#[tokio::test]
async fn test_closed_channel_fails_pending_calls() {
    let mut harness = RpcHarness::new();
    let ticket = harness.correlator.issue("evaluate", &()).await.unwrap();
    let _ = harness.next_request().await.unwrap();

    harness.close().await.unwrap();
    let result: Result<(), _> = ticket.wait(WAIT).await;
    assert!(matches!(result, Err(RpcError::TransportError(_))));
}

#[tokio::test]
async fn test_worker_errors_surface_as_remote_errors() {
    let harness = RpcHarness::new();
    let (correlator, worker) = harness.into_worker(sample_model());

    let result: Result<(), _> = correlator.call("unknown", &(), WAIT).await;
    match result {
        Err(RpcError::RemoteError(message)) => assert!(message.contains("unknown")),
        other => panic!("Expected remote error, got {other:?}"),
    }
    worker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_blocking_from_plain_thread() {
    let harness = RpcHarness::new();
    let (correlator, worker) = harness.into_worker(sample_model());
    let handle = tokio::runtime::Handle::current();

    let value = tokio::task::spawn_blocking(move || {
        correlator.call_blocking::<_, i64>(&handle, "echo", &5, WAIT)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(value, 5);
    worker.shutdown().await;
}

#[tokio::test]
async fn test_framed_round_trip_with_compression() {
    init_test_logging();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);

    // Echo server on the far end of the pipe
    let server = tokio::spawn(async move {
        let replies = FramedTransport::new(server_write, PayloadCompressor::default());
        let (tx, mut rx) = mpsc::channel(16);
        let reader =
            tokio::spawn(async move { read_frames(server_read, &PayloadCompressor::default(), tx).await });
        while let Some(request) = rx.recv().await {
            let reply = Envelope::request(request.kind, request.correlation_id, request.payload);
            replies.send(reply).await.unwrap();
        }
        reader.await.unwrap()
    });

    let transport = Arc::new(FramedTransport::new(client_write, PayloadCompressor::default()));
    let correlator = Correlator::new(transport.clone(), CorrelatorConfig::default());
    let (incoming_tx, incoming_rx) = mpsc::channel(16);
    tokio::spawn(async move { read_frames(client_read, &PayloadCompressor::default(), incoming_tx).await });
    correlator.spawn_dispatch(incoming_rx);

    let big = "x".repeat(200_000);
    let echoed: String = correlator.call("echo", &big, WAIT).await.unwrap();
    assert_eq!(echoed, big);

    let small: i64 = correlator.call("echo", &7, WAIT).await.unwrap();
    assert_eq!(small, 7);

    let stats = transport.stats().await;
    assert_eq!(stats.frames_sent, 2);
    assert!(stats.bytes_sent < 200_000);

    server.abort();
}
