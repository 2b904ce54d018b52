//! Delivery loop tests over the scripted mock transport.
//!
//! Run with: cargo test --test consumer_flow
//!
//! Each test scripts one or more broker sessions, runs the consumer until the
//! expected number of dispositions is recorded, then stops it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use quiver::broker::mock::{death_headers, MockStep};
use quiver::broker::{
    BrokerEndpoint, ConnectionManager, ConnectionState, Disposition, MessageEnvelope,
    MockTransport, ReconnectStrategy, TransportError,
};
use quiver::consumer::{Consumer, ConsumerError, ConsumerOptions, StopHandle};
use quiver::event::DecodedEvent;
use quiver::handler::{EffectHandler, HandlerError};
use quiver::idempotency::InMemoryIdempotencyStore;

const QUEUE: &str = "orders.queue";

/// Handler whose result is chosen by the event name prefix.
#[derive(Clone, Default)]
struct PrefixHandler {
    calls: Arc<AtomicUsize>,
}

impl PrefixHandler {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EffectHandler for PrefixHandler {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match event.event_name.split('.').next() {
            Some("business") => Err(HandlerError::business("rejected by domain rules")),
            Some("transient") => Err(HandlerError::transient("database timeout")),
            Some("panic") => panic!("handler bug"),
            _ => Ok(()),
        }
    }
}

fn delivery(tag: u64, event_name: &str, event_id: &str) -> MockStep {
    let body = json!({
        "event_name": event_name,
        "event_id": event_id,
        "payload": {"order_id": "o-1"}
    });
    MockStep::Deliver(MessageEnvelope::new(tag, serde_json::to_vec(&body).unwrap()))
}

fn consumer(
    transport: &MockTransport,
    handler: PrefixHandler,
) -> Consumer<MockTransport, PrefixHandler> {
    let connection = ConnectionManager::new(
        transport.clone(),
        BrokerEndpoint::default(),
        ReconnectStrategy::default(),
    );
    let options = ConsumerOptions::new(QUEUE)
        .with_consumer_tag("test-consumer")
        .with_prefetch_count(5);
    Consumer::new(connection, handler, options)
}

/// Stop the consumer once `count` dispositions have been recorded.
async fn stop_after_dispositions(transport: MockTransport, stop: StopHandle, count: usize) {
    while transport.dispositions().await.len() < count {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stop.stop();
}

async fn run_until(
    consumer: &mut Consumer<MockTransport, PrefixHandler>,
    transport: &MockTransport,
    count: usize,
) -> Result<(), ConsumerError> {
    let stopper = tokio::spawn(stop_after_dispositions(
        transport.clone(),
        consumer.stop_handle(),
        count,
    ));
    let result = tokio::time::timeout(Duration::from_secs(120), consumer.run())
        .await
        .expect("consumer did not stop");
    stopper.abort();
    result
}

#[tokio::test(start_paused = true)]
async fn test_each_outcome_gets_one_disposition() {
    let transport = MockTransport::new();
    transport
        .push_session(vec![
            delivery(1, "ok.created", "e1"),
            MockStep::Deliver(MessageEnvelope::new(2, b"not json {".to_vec())),
            delivery(3, "business.rejected", "e3"),
            delivery(4, "transient.failed", "e4"),
        ])
        .await;
    let handler = PrefixHandler::default();
    let mut consumer = consumer(&transport, handler.clone());

    run_until(&mut consumer, &transport, 4).await.unwrap();

    assert_eq!(
        transport.dispositions().await,
        vec![
            (1, Disposition::Ack),
            (2, Disposition::Nack { requeue: false }),
            (3, Disposition::Nack { requeue: false }),
            (4, Disposition::Nack { requeue: true }),
        ]
    );
    // The malformed body never reached the handler.
    assert_eq!(handler.calls(), 3);
    assert_eq!(transport.prefetch_calls().await, vec![5]);
    assert_eq!(transport.subscriptions().await, vec![QUEUE.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_ceiling_dead_letters() {
    let transport = MockTransport::new();
    let exhausted = MessageEnvelope::new(
        9,
        serde_json::to_vec(&json!({"event_name": "transient.x", "event_id": "e9"})).unwrap(),
    )
    .with_headers(death_headers(3, QUEUE));
    transport
        .push_session(vec![MockStep::Deliver(exhausted)])
        .await;
    let mut consumer = consumer(&transport, PrefixHandler::default());

    run_until(&mut consumer, &transport, 1).await.unwrap();

    assert_eq!(
        transport.dispositions().await,
        vec![(9, Disposition::Nack { requeue: false })]
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_delivery_skips_handler() {
    let transport = MockTransport::new();
    transport
        .push_session(vec![
            delivery(1, "ok.created", "same-id"),
            delivery(2, "ok.created", "same-id"),
        ])
        .await;
    let handler = PrefixHandler::default();
    let mut consumer = consumer(&transport, handler.clone())
        .with_idempotency_store(Arc::new(InMemoryIdempotencyStore::new()));

    run_until(&mut consumer, &transport, 2).await.unwrap();

    assert_eq!(handler.calls(), 1);
    assert_eq!(
        transport.dispositions().await,
        vec![(1, Disposition::Ack), (2, Disposition::Ack)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_reconnects_and_resubscribes() {
    let transport = MockTransport::new();
    transport
        .push_session(vec![
            delivery(1, "ok.created", "e1"),
            MockStep::Fail(TransportError::connection_lost("connection reset by peer")),
        ])
        .await;
    transport
        .push_session(vec![delivery(1, "ok.confirmed", "e2")])
        .await;
    let mut consumer = consumer(&transport, PrefixHandler::default());

    run_until(&mut consumer, &transport, 2).await.unwrap();

    assert_eq!(transport.connect_count().await, 2);
    assert_eq!(transport.prefetch_calls().await, vec![5, 5]);
    assert_eq!(
        transport.subscriptions().await,
        vec![QUEUE.to_string(), QUEUE.to_string()]
    );
    // Old handle closed on reconnect, new one on stop.
    assert_eq!(transport.close_count().await, 2);
    assert_eq!(consumer.connection().state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_stream_end_reconnects() {
    let transport = MockTransport::new();
    transport.push_session(vec![MockStep::End]).await;
    transport
        .push_session(vec![delivery(1, "ok.created", "e1")])
        .await;
    let mut consumer = consumer(&transport, PrefixHandler::default());

    run_until(&mut consumer, &transport, 1).await.unwrap();

    assert_eq!(transport.connect_count().await, 2);
    assert_eq!(transport.subscriptions().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_other_transport_error_does_not_reconnect() {
    let transport = MockTransport::new();
    transport
        .push_session(vec![
            MockStep::Fail(TransportError::other("unexpected frame")),
            delivery(1, "ok.created", "e1"),
        ])
        .await;
    let mut consumer = consumer(&transport, PrefixHandler::default());

    run_until(&mut consumer, &transport, 1).await.unwrap();

    assert_eq!(transport.connect_count().await, 1);
    assert_eq!(transport.dispositions().await, vec![(1, Disposition::Ack)]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_surfaces_and_closes() {
    let transport = MockTransport::new();
    transport
        .push_session(vec![MockStep::Fail(TransportError::timeout(
            "missed heartbeats from server",
        ))])
        .await;
    let mut consumer = consumer(&transport, PrefixHandler::default());

    // Fail the reconnect only, after the first connection is up.
    let inject = {
        let transport = transport.clone();
        async move {
            while transport.connect_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            transport
                .fail_next_connect(TransportError::connection_lost("connection refused"))
                .await;
        }
    };
    let (result, ()) = tokio::join!(consumer.run(), inject);

    assert!(matches!(result, Err(ConsumerError::ReconnectFailed(_))));
    assert_eq!(consumer.connection().state(), ConnectionState::Failed);
    assert!(consumer.connection().handle().is_none());
    assert_eq!(transport.close_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_reconnect_exits_cleanly() {
    let transport = MockTransport::new();
    transport
        .push_session(vec![MockStep::Fail(TransportError::connection_lost("down"))])
        .await;
    let connection = ConnectionManager::new(
        transport.clone(),
        BrokerEndpoint::default(),
        ReconnectStrategy::Exponential {
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        },
    );
    let mut consumer = Consumer::new(
        connection,
        PrefixHandler::default(),
        ConsumerOptions::new(QUEUE),
    );
    consumer.stop_handle().stop_after(Duration::from_millis(50));

    let started = tokio::time::Instant::now();
    consumer.run().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(transport.connect_count().await, 1);
    assert_eq!(transport.close_count().await, 1);
    assert_eq!(consumer.connection().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_initial_connect_failure() {
    let transport = MockTransport::new();
    transport
        .fail_next_connect(TransportError::connection_lost("connection refused"))
        .await;
    let mut consumer = consumer(&transport, PrefixHandler::default());

    let err = consumer.run().await.unwrap_err();

    assert!(matches!(err, ConsumerError::ConnectFailed(_)));
    assert_eq!(transport.subscriptions().await.len(), 0);
}

#[tokio::test]
async fn test_stop_before_run_closes_connection() {
    let transport = MockTransport::new();
    let mut consumer = consumer(&transport, PrefixHandler::default());
    consumer.stop();

    consumer.run().await.unwrap();

    assert_eq!(transport.connect_count().await, 1);
    assert_eq!(transport.close_count().await, 1);
    assert!(transport.dispositions().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_consumer_stops_on_signal() {
    let transport = MockTransport::new();
    let mut consumer = consumer(&transport, PrefixHandler::default());
    consumer.stop_handle().stop_after(Duration::from_secs(30));

    consumer.run().await.unwrap();

    assert_eq!(transport.close_count().await, 1);
}

#[tokio::test]
async fn test_handler_panic_still_closes_connection() {
    let transport = MockTransport::new();
    transport
        .push_session(vec![delivery(1, "panic.now", "e1")])
        .await;
    let mut consumer = consumer(&transport, PrefixHandler::default());

    let task = tokio::spawn(async move { consumer.run().await });
    let err = task.await.unwrap_err();

    assert!(err.is_panic());
    assert_eq!(transport.close_count().await, 1);
    assert!(transport.dispositions().await.is_empty());
}
