// crates/stage-relay-broker/src/transport/amqp.rs
// ============================================================================
// Module: Stage Relay AMQP Transport
// Description: AMQP 0-9-1 connector and session built on lapin.
// Purpose: Consume from and publish to a RabbitMQ topic exchange.
// Dependencies: stage-relay-core, lapin, futures-util, async-trait, tracing
// ============================================================================

//! ## Overview
//! [`AmqpConnector`] opens one connection and one channel per session,
//! declares the topic exchange and the durable queue, binds every pattern,
//! sets the prefetch window, and enables publisher confirms.
//! Invariants:
//! - A publish succeeds only after the broker confirms it.
//! - Persistent messages are sent with delivery mode 2.
//! - Deliveries are acknowledged explicitly; auto-ack is never enabled.

// ============================================================================
// SECTION: Imports
// ============================================================================

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::BasicProperties;
use lapin::Channel;
use lapin::Connection;
use lapin::ConnectionProperties;
use lapin::Consumer;
use lapin::ExchangeKind;
use lapin::options::BasicAckOptions;
use lapin::options::BasicConsumeOptions;
use lapin::options::BasicPublishOptions;
use lapin::options::BasicQosOptions;
use lapin::options::ConfirmSelectOptions;
use lapin::options::ExchangeDeclareOptions;
use lapin::options::QueueBindOptions;
use lapin::options::QueueDeclareOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use stage_relay_config::BrokerConfig;
use stage_relay_config::ConfigError;
use stage_relay_core::BusError;
use stage_relay_core::Delivery;
use stage_relay_core::DeliveryTag;
use stage_relay_core::MessageBus;
use stage_relay_core::OutboundMessage;
use tracing::info;

use crate::transport::BusConnector;
use crate::transport::BusSession;
use crate::transport::QueueBinding;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// AMQP delivery mode marking a message persistent.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Consumer tag announced to the broker.
const CONSUMER_TAG: &str = "stage-relay";

// ============================================================================
// SECTION: Connector
// ============================================================================

/// Connector for an AMQP 0-9-1 broker.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    /// Connection URI including credentials.
    uri: String,
    /// Log-safe broker target.
    target: String,
}

impl AmqpConnector {
    /// Creates a connector for an `amqp://` URI.
    #[must_use]
    pub fn new(uri: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            target: target.into(),
        }
    }

    /// Creates a connector from broker settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the settings do not form an AMQP URI.
    pub fn from_config(broker: &BrokerConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(broker.amqp_uri()?, broker.display_target()))
    }
}

#[async_trait]
impl BusConnector for AmqpConnector {
    type Session = AmqpSession;

    async fn connect(&self, binding: &QueueBinding) -> Result<AmqpSession, BusError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(connection_error)?;
        let channel = connection.create_channel().await.map_err(connection_error)?;
        channel
            .exchange_declare(
                &binding.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(connection_error)?;
        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(connection_error)?;
        for pattern in &binding.patterns {
            channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(connection_error)?;
        }
        channel
            .basic_qos(binding.prefetch.max(1), BasicQosOptions::default())
            .await
            .map_err(connection_error)?;
        channel.confirm_select(ConfirmSelectOptions::default()).await.map_err(connection_error)?;
        let consumer = channel
            .basic_consume(
                &binding.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(connection_error)?;
        info!(
            target_broker = %self.target,
            exchange = %binding.exchange,
            queue = %binding.queue,
            bindings = binding.patterns.len(),
            "amqp consumer started"
        );
        Ok(AmqpSession {
            _connection: connection,
            channel,
            consumer,
            exchange: binding.exchange.clone(),
        })
    }

    fn describe(&self) -> String {
        self.target.clone()
    }
}

// ============================================================================
// SECTION: Session
// ============================================================================

/// Consumer session over one AMQP channel.
pub struct AmqpSession {
    /// Owning connection; closed when the session drops.
    _connection: Connection,
    /// Channel used for publish, ack, and consume.
    channel: Channel,
    /// Delivery stream.
    consumer: Consumer,
    /// Exchange outbound messages are published to.
    exchange: String,
}

#[async_trait]
impl MessageBus for AmqpSession {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BusError> {
        let properties = if message.persistent {
            BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        } else {
            BasicProperties::default()
        };
        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|err| BusError::Publish(err.to_string()))?;
        match confirm.await.map_err(|err| BusError::Publish(err.to_string()))? {
            Confirmation::Nack(_) => Err(BusError::Publish(format!(
                "broker rejected publish to {}",
                message.routing_key
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError> {
        self.channel
            .basic_ack(tag.0, BasicAckOptions::default())
            .await
            .map_err(|err| BusError::Ack(err.to_string()))
    }
}

#[async_trait]
impl BusSession for AmqpSession {
    async fn next_delivery(&mut self) -> Result<Delivery, BusError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Delivery {
                tag: DeliveryTag(delivery.delivery_tag),
                routing_key: delivery.routing_key.as_str().to_string(),
                body: delivery.data.clone(),
                redelivered: delivery.redelivered,
            }),
            Some(Err(err)) => Err(connection_error(err)),
            None => Err(BusError::Closed),
        }
    }
}

/// Maps a lapin error onto a connection failure.
fn connection_error(err: lapin::Error) -> BusError {
    BusError::Connection(err.to_string())
}
