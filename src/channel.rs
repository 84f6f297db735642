// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module implements the driver traits on top of `lapin`. It establishes
//! connections to the RabbitMQ server within a bounded dial timeout, opens
//! channels on them and turns lapin's connection error hook into the one-shot
//! close notification the reconnect supervisor waits on.

use crate::{
    driver::{
        Acknowledger, Broker, BrokerChannel, BrokerConnection, CloseNotification, Delivery,
        DeliveryStream,
    },
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Upper bound for establishing the TCP connection and AMQP handshake.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

const REPLY_SUCCESS: u16 = 200;

/// `lapin` backed [`Broker`].
#[derive(Debug, Clone)]
pub struct LapinBroker {
    connection_name: String,
}

impl LapinBroker {
    pub fn new(connection_name: &str) -> Self {
        LapinBroker {
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn dial(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match tokio::time::timeout(timeout, Connection::connect(url, options)).await {
            Ok(Ok(c)) => Ok(c),
            Ok(Err(err)) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            Err(_) => {
                error!(timeout = ?timeout, "timed out connecting");
                Err(AmqpError::ConnectionError(format!(
                    "dial timed out after {:?}",
                    timeout
                )))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection::new(conn)))
    }
}

/// Close state of a connection: the reason once closed and the parties still waiting.
#[derive(Default)]
struct CloseNotifier {
    closed: Option<Option<String>>,
    listeners: Vec<oneshot::Sender<Option<String>>>,
}

impl CloseNotifier {
    fn subscribe(&mut self) -> CloseNotification {
        let (tx, rx) = oneshot::channel();
        match &self.closed {
            Some(reason) => {
                let _ = tx.send(reason.clone());
            }
            None => self.listeners.push(tx),
        }
        rx
    }

    fn fire(&mut self, reason: Option<String>) {
        if self.closed.is_some() {
            return;
        }

        for tx in self.listeners.drain(..) {
            let _ = tx.send(reason.clone());
        }
        self.closed = Some(reason);
    }
}

/// `lapin` backed [`BrokerConnection`].
pub struct LapinConnection {
    conn: Connection,
    notifier: Arc<Mutex<CloseNotifier>>,
}

impl LapinConnection {
    fn new(conn: Connection) -> Self {
        let notifier = Arc::new(Mutex::new(CloseNotifier::default()));

        let on_error = notifier.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            on_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .fire(Some(err.to_string()));
        });

        LapinConnection { conn, notifier }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel: c }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn notify_close(&self) -> CloseNotification {
        self.notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        // Waiters learn about an intentional close before the socket goes away.
        self.notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fire(None);

        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

/// `lapin` backed [`BrokerChannel`].
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        if prefetch_size != 0 {
            warn!(prefetch_size, "prefetch size is not supported by lapin, ignoring");
        }

        match self.channel.basic_qos(prefetch_count, options).await {
            Err(err) => {
                error!(error = err.to_string(), "failure to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(def.name.clone(), err.to_string()))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(def.name.clone(), err.to_string()))
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                    err.to_string(),
                )
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(exchange, routing_key, options, body, properties)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(
                    queue.to_owned(),
                    err.to_string(),
                ))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery::new(
                    delivery.data,
                    delivery.properties,
                    Box::new(LapinAcker(delivery.acker)),
                )),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifier_fires_once_for_every_listener() {
        let mut notifier = CloseNotifier::default();
        let first = notifier.subscribe();
        let second = notifier.subscribe();

        notifier.fire(Some("connection reset".to_owned()));
        notifier.fire(None);

        assert_eq!(first.await.unwrap(), Some("connection reset".to_owned()));
        assert_eq!(second.await.unwrap(), Some("connection reset".to_owned()));
    }

    #[tokio::test]
    async fn late_listener_sees_the_recorded_reason() {
        let mut notifier = CloseNotifier::default();
        notifier.fire(None);

        assert_eq!(notifier.subscribe().await.unwrap(), None);
    }
}
