//! Mock broker transport for testing.
//!
//! Each successful `connect` pops the next scripted session. A session is a
//! queue of steps (deliveries, transport errors, end of stream); once it runs
//! dry the handle idles like a quiet broker until the consumer is stopped.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldArray, FieldTable};
use tokio::sync::Mutex;

use super::{
    Acknowledger, BrokerEndpoint, BrokerHandle, DeliveryTag, Disposition, MessageEnvelope,
    Transport, TransportError,
};

/// One scripted step of a mock session.
#[derive(Debug, Clone)]
pub enum MockStep {
    Deliver(MessageEnvelope),
    Fail(TransportError),
    End,
}

#[derive(Debug, Default)]
struct MockState {
    sessions: VecDeque<Vec<MockStep>>,
    connect_failures: VecDeque<TransportError>,
    dispositions: Vec<(DeliveryTag, Disposition)>,
    fail_settle: bool,
    connects: usize,
    closes: usize,
    prefetch: Vec<u16>,
    subscriptions: Vec<String>,
}

/// Scripted in-memory transport.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the steps served by the next connection.
    pub async fn push_session(&self, steps: Vec<MockStep>) {
        self.state.lock().await.sessions.push_back(steps);
    }

    /// Make the next connect attempt fail with `error`.
    pub async fn fail_next_connect(&self, error: TransportError) {
        self.state.lock().await.connect_failures.push_back(error);
    }

    /// Make every ack/nack fail (the disposition is still recorded).
    pub async fn set_fail_settle(&self, fail: bool) {
        self.state.lock().await.fail_settle = fail;
    }

    pub async fn dispositions(&self) -> Vec<(DeliveryTag, Disposition)> {
        self.state.lock().await.dispositions.clone()
    }

    pub async fn connect_count(&self) -> usize {
        self.state.lock().await.connects
    }

    pub async fn close_count(&self) -> usize {
        self.state.lock().await.closes
    }

    pub async fn prefetch_calls(&self) -> Vec<u16> {
        self.state.lock().await.prefetch.clone()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.state.lock().await.subscriptions.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Handle = MockHandle;

    async fn connect(&self, _endpoint: &BrokerEndpoint) -> Result<MockHandle, TransportError> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        state.connects += 1;
        let steps = state.sessions.pop_front().unwrap_or_default();

        Ok(MockHandle {
            state: Arc::clone(&self.state),
            steps: steps.into(),
            subscribed: false,
            closed: false,
        })
    }
}

/// Handle served by [`MockTransport`].
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    steps: VecDeque<MockStep>,
    subscribed: bool,
    closed: bool,
}

#[async_trait]
impl Acknowledger for MockHandle {
    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), TransportError> {
        record(&self.state, delivery_tag, Disposition::Ack).await
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        record(&self.state, delivery_tag, Disposition::Nack { requeue }).await
    }
}

async fn record(
    state: &Mutex<MockState>,
    delivery_tag: DeliveryTag,
    disposition: Disposition,
) -> Result<(), TransportError> {
    let mut state = state.lock().await;
    state.dispositions.push((delivery_tag, disposition));
    if state.fail_settle {
        return Err(TransportError::connection_lost("mock settle failure"));
    }
    Ok(())
}

#[async_trait]
impl BrokerHandle for MockHandle {
    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<(), TransportError> {
        self.state.lock().await.prefetch.push(prefetch_count);
        Ok(())
    }

    async fn subscribe(&mut self, queue: &str, _consumer_tag: &str) -> Result<(), TransportError> {
        self.state.lock().await.subscriptions.push(queue.to_string());
        self.subscribed = true;
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<MessageEnvelope, TransportError>> {
        if !self.subscribed || self.closed {
            return Some(Err(TransportError::connection_lost("mock handle not consuming")));
        }
        match self.steps.pop_front() {
            Some(MockStep::Deliver(envelope)) => Some(Ok(envelope)),
            Some(MockStep::Fail(error)) => Some(Err(error)),
            Some(MockStep::End) => None,
            None => futures::future::pending().await,
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().await.closes += 1;
        }
    }
}

/// Standalone acknowledger that records every call.
#[derive(Default)]
pub struct RecordingAcker {
    calls: Mutex<Vec<(DeliveryTag, Disposition)>>,
    fail: Mutex<bool>,
}

impl RecordingAcker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail(&self, fail: bool) {
        *self.fail.lock().await = fail;
    }

    pub async fn calls(&self) -> Vec<(DeliveryTag, Disposition)> {
        self.calls.lock().await.clone()
    }

    async fn push(
        &self,
        delivery_tag: DeliveryTag,
        disposition: Disposition,
    ) -> Result<(), TransportError> {
        self.calls.lock().await.push((delivery_tag, disposition));
        if *self.fail.lock().await {
            return Err(TransportError::connection_lost("recording acker failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), TransportError> {
        self.push(delivery_tag, Disposition::Ack).await
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.push(delivery_tag, Disposition::Nack { requeue }).await
    }
}

/// Headers carrying an `x-death` history whose latest entry has `count`.
pub fn death_headers(count: i64, queue: &str) -> FieldTable {
    let mut death = FieldTable::default();
    death.insert("count".into(), AMQPValue::LongLongInt(count));
    death.insert("queue".into(), AMQPValue::LongString(queue.into()));
    death.insert("reason".into(), AMQPValue::LongString("rejected".into()));

    let mut headers = FieldTable::default();
    headers.insert(
        "x-death".into(),
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_serves_scripted_session() {
        let transport = MockTransport::new();
        transport
            .push_session(vec![
                MockStep::Deliver(MessageEnvelope::new(1, b"{}".to_vec())),
                MockStep::End,
            ])
            .await;

        let mut handle = transport.connect(&BrokerEndpoint::default()).await.unwrap();
        handle.subscribe("work", "tag").await.unwrap();

        let first = handle.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.delivery_tag, 1);
        assert!(handle.next_delivery().await.is_none());
        assert_eq!(transport.subscriptions().await, vec!["work".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_connect_failure() {
        let transport = MockTransport::new();
        transport
            .fail_next_connect(TransportError::connection_lost("refused"))
            .await;

        assert!(transport.connect(&BrokerEndpoint::default()).await.is_err());
        assert!(transport.connect(&BrokerEndpoint::default()).await.is_ok());
        assert_eq!(transport.connect_count().await, 1);
    }

    #[tokio::test]
    async fn test_recording_acker_records_on_failure() {
        let acker = RecordingAcker::new();
        acker.set_fail(true).await;

        assert!(acker.nack(3, true).await.is_err());
        assert_eq!(
            acker.calls().await,
            vec![(3, Disposition::Nack { requeue: true })]
        );
    }
}
