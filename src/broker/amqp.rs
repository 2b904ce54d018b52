//! AMQP (RabbitMQ) transport.
//!
//! One connection and one channel per handle. Deliveries are consumed with
//! manual acknowledgment and settled with `basic.ack` / `basic.nack` on the
//! same channel.

use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer,
};
use tracing::debug;

use super::{
    Acknowledger, BrokerEndpoint, BrokerHandle, DeliveryTag, MessageEnvelope, Transport,
    TransportError, TransportErrorKind,
};

/// Reply code sent on orderly channel/connection close.
const REPLY_SUCCESS: u16 = 200;

/// Connection name reported to the broker (visible in the management UI).
const CONNECTION_NAME: &str = "quiver";

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        let kind = match &err {
            lapin::Error::IOError(io) if io.kind() == ErrorKind::TimedOut => {
                TransportErrorKind::Timeout
            }
            lapin::Error::IOError(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidChannel(_) => TransportErrorKind::ConnectionLost,
            lapin::Error::MissingHeartbeatError => TransportErrorKind::Timeout,
            lapin::Error::ProtocolError(_) => TransportErrorKind::ProtocolError,
            _ => TransportErrorKind::Other,
        };
        TransportError::new(kind, err.to_string())
    }
}

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    type Handle = AmqpHandle;

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<AmqpHandle, TransportError> {
        let properties = ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into());

        let connection = tokio::time::timeout(
            endpoint.connect_timeout,
            Connection::connect_uri(endpoint.amqp_uri(), properties),
        )
        .await
        .map_err(|_| {
            TransportError::timeout(format!(
                "connect to {}:{} exceeded {:?}",
                endpoint.host, endpoint.port, endpoint.connect_timeout
            ))
        })??;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel setup failed").await;
                return Err(e.into());
            }
        };

        Ok(AmqpHandle {
            connection,
            channel,
            consumer: None,
            op_timeout: endpoint.read_timeout,
        })
    }
}

/// Live lapin connection + channel, plus the consumer stream once subscribed.
pub struct AmqpHandle {
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
    op_timeout: Duration,
}

impl AmqpHandle {
    /// Run a channel operation under the read timeout.
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T, TransportError>
    where
        F: Future<Output = lapin::Result<T>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::timeout(format!(
                "{} exceeded {:?}",
                operation, self.op_timeout
            ))),
        }
    }
}

fn envelope_from(delivery: Delivery) -> MessageEnvelope {
    let headers = delivery.properties.headers().clone().unwrap_or_default();
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());

    MessageEnvelope {
        body: delivery.data,
        delivery_tag: delivery.delivery_tag,
        headers,
        message_id,
        redelivered: delivery.redelivered,
    }
}

#[async_trait]
impl Acknowledger for AmqpHandle {
    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), TransportError> {
        self.bounded(
            "basic.ack",
            self.channel
                .basic_ack(delivery_tag, BasicAckOptions { multiple: false }),
        )
        .await
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.bounded(
            "basic.nack",
            self.channel.basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            ),
        )
        .await
    }
}

#[async_trait]
impl BrokerHandle for AmqpHandle {
    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<(), TransportError> {
        self.bounded(
            "basic.qos",
            self.channel
                .basic_qos(prefetch_count, BasicQosOptions { global: false }),
        )
        .await
    }

    async fn subscribe(&mut self, queue: &str, consumer_tag: &str) -> Result<(), TransportError> {
        let options = BasicConsumeOptions {
            no_ack: false,
            ..Default::default()
        };
        let consumer = self
            .bounded(
                "basic.consume",
                self.channel
                    .basic_consume(queue, consumer_tag, options, FieldTable::default()),
            )
            .await?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Subscribed with manual ack");
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<MessageEnvelope, TransportError>> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Some(Err(TransportError::other(
                "next_delivery called before subscribe",
            )));
        };

        match consumer.next().await? {
            Ok(delivery) => Some(Ok(envelope_from(delivery))),
            Err(e) => Some(Err(e.into())),
        }
    }

    async fn close(&mut self) {
        self.consumer = None;
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "consumer closing").await {
            debug!(error = %e, "Ignoring channel close error");
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "consumer closing").await {
            debug!(error = %e, "Ignoring connection close error");
        }
    }
}
