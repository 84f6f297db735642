// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Driver Abstraction
//!
//! The client never talks to the wire directly. It orchestrates a broker driver
//! through the traits in this module: dialing a connection, opening a channel,
//! declaring topology, publishing, consuming and acknowledging. The production
//! implementation lives in [`crate::channel`] and is backed by `lapin`; tests
//! substitute mocks so reconnect and acknowledgment policies can be exercised
//! without a broker.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions},
    BasicProperties,
};
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::oneshot;

#[cfg(test)]
use mockall::automock;

/// Receives the close reason of a connection, exactly once.
///
/// `Some(reason)` means the connection was lost; `None`, or a dropped sender,
/// means it was closed on purpose.
pub type CloseNotification = oneshot::Receiver<Option<String>>;

/// Server-pushed deliveries of a single consumer. The stream ends when the
/// channel carrying the consumer goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Entry point of a driver: knows how to reach a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a new connection, giving up after `timeout`.
    async fn dial(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live connection to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Registers interest in the closure of this connection.
    fn notify_close(&self) -> CloseNotification;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel multiplexed over a [`BrokerConnection`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles a single delivered message.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// An inbound message. Its settlement is decided by the consumer handler.
pub struct Delivery {
    pub data: Vec<u8>,
    pub properties: BasicProperties,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(data: Vec<u8>, properties: BasicProperties, acker: Box<dyn Acknowledger>) -> Self {
        Delivery {
            data,
            properties,
            acker,
        }
    }

    /// Acknowledges this message only, never a batch.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Negatively acknowledges this message only, never a batch.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("data", &self.data.len())
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}
