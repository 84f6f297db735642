// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module runs the delivery loops of the client. Every successful consume
//! spawns an independent task that feeds the queue's deliveries to its handler
//! until the delivery stream closes. Registrations outlive the channel they were
//! started on: after a reconnect the supervisor asks the dispatcher to re-arm
//! all of them on the new channel.

use crate::{
    config::ClientConfig,
    consumer::{consume, ConsumerHandler},
    driver::BrokerChannel,
    errors::AmqpError,
};
use futures_util::StreamExt;
use lapin::options::BasicConsumeOptions;
use opentelemetry::global;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, Instrument, Span};
use uuid::Uuid;

/// A queue and the handler consuming it.
#[derive(Clone)]
pub(crate) struct RabbitMQDispatcherDefinition {
    pub(crate) queue: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

/// Owns the consume registrations of a client.
pub(crate) struct RabbitMQDispatcher {
    options: BasicConsumeOptions,
    requeue_on_failure: bool,
    dispatchers_def: Mutex<Vec<RabbitMQDispatcherDefinition>>,
}

/// Exclusive access to the registrations.
///
/// Consumers are started and re-armed only through this guard, so a channel
/// swap never interleaves with a new registration.
pub(crate) struct Registrations<'a> {
    dispatcher: &'a RabbitMQDispatcher,
    defs: MutexGuard<'a, Vec<RabbitMQDispatcherDefinition>>,
}

impl RabbitMQDispatcher {
    pub(crate) fn new(cfg: &ClientConfig) -> Self {
        RabbitMQDispatcher {
            options: BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: cfg.exclusive,
                nowait: cfg.no_wait,
            },
            requeue_on_failure: cfg.requeue_on_failure,
            dispatchers_def: Mutex::new(Vec::new()),
        }
    }

    /// Waits for exclusive access to the registrations.
    pub(crate) async fn acquire(&self) -> Registrations<'_> {
        Registrations {
            dispatcher: self,
            defs: self.dispatchers_def.lock().await,
        }
    }

    async fn start(
        &self,
        channel: Arc<dyn BrokerChannel>,
        def: &RabbitMQDispatcherDefinition,
        span: Span,
    ) -> Result<(), AmqpError> {
        let tag = format!("{}-{}", def.queue, Uuid::new_v4());

        let mut consumer = match channel.consume(&def.queue, &tag, self.options).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = %def.queue,
                    "failure starts delivering queued messages"
                );
                Err(err)
            }
            Ok(c) => Ok(c),
        }?;

        let queue = def.queue.clone();
        let handler = def.handler.clone();
        let requeue_on_failure = self.requeue_on_failure;

        tokio::spawn(
            async move {
                let tracer = global::tracer("amqp consumer");

                while let Some(result) = consumer.next().await {
                    match result {
                        Ok(delivery) => {
                            if let Err(err) = consume(
                                &tracer,
                                &queue,
                                delivery,
                                handler.as_ref(),
                                requeue_on_failure,
                            )
                            .await
                            {
                                error!(error = err.to_string(), "error consume msg");
                            }
                        }

                        Err(err) => error!(error = err.to_string(), "errors consume msg"),
                    }
                }

                debug!(queue, "delivery stream closed");
            }
            .instrument(span),
        );

        Ok(())
    }
}

impl Registrations<'_> {
    /// Starts consuming `queue` on `channel` and remembers the registration
    /// so it can be re-armed after a reconnect.
    pub(crate) async fn register(
        &mut self,
        channel: Arc<dyn BrokerChannel>,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        span: Span,
    ) -> Result<(), AmqpError> {
        let def = RabbitMQDispatcherDefinition {
            queue: queue.to_owned(),
            handler,
        };

        self.dispatcher.start(channel, &def, span).await?;
        self.defs.push(def);

        Ok(())
    }

    /// Starts every known registration on a fresh channel. Returns how many
    /// consumers are running afterwards.
    pub(crate) async fn rearm(&mut self, channel: Arc<dyn BrokerChannel>, span: Span) -> usize {
        let mut armed = 0;

        for def in self.defs.iter() {
            match self.dispatcher.start(channel.clone(), def, span.clone()).await {
                Ok(()) => armed += 1,
                Err(err) => error!(
                    error = err.to_string(),
                    queue = %def.queue,
                    "failure to re-arm consumer"
                ),
            }
        }

        armed
    }

    /// Forgets every registration; running loops end with their channel.
    pub(crate) fn clear(&mut self) {
        self.defs.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.defs.len()
    }
}
