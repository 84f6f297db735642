// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient RabbitMQ Client
//!
//! `Client` owns exactly one connection and one channel at a time. Construction
//! connects, installs the topology and starts the reconnect supervisor. The live
//! connection and channel are kept together in a generation-tagged `Session`
//! behind a lock; publishers and consumers work on a snapshot of it and get
//! `ChannelNotInitialized` while no session is installed, for instance during a
//! reconnect.

use crate::{
    channel::{LapinBroker, DIAL_TIMEOUT},
    config::ClientConfig,
    consumer::ConsumerHandler,
    dispatcher::{RabbitMQDispatcher, Registrations},
    driver::{Broker, BrokerChannel, BrokerConnection},
    errors::AmqpError,
    publisher::{message_properties, Headers},
    supervisor,
    topology::{AmqpTopology, Topology},
};
use lapin::options::{BasicPublishOptions, BasicQosOptions};
use opentelemetry::Context;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info_span, Instrument, Span};

/// Called once when the supervisor gives up reconnecting. The owning process
/// is expected to shut down.
pub type ShutdownHook = Arc<dyn Fn() + Send + Sync>;

/// Observable state of the reconnect supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Waiting for the current connection to close
    Watching,
    /// Connection lost, attempting to reconnect
    Reconnecting,
    /// Not supervising: not started yet or the connection was closed on purpose
    Stopped,
    /// Reconnect attempts exhausted, shutdown was signaled
    Fatal,
}

/// The connection and channel currently in use.
pub(crate) struct Session {
    pub(crate) generation: u64,
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) channel: Arc<dyn BrokerChannel>,
}

impl Session {
    /// Closes the channel, then the connection. Both are attempted; the first
    /// error is returned.
    async fn teardown(&self) -> Result<(), AmqpError> {
        let channel = self.channel.close().await;
        let connection = self.connection.close().await;
        channel.and(connection)
    }
}

struct Inner {
    broker: Arc<dyn Broker>,
    config: ClientConfig,
    session: RwLock<Option<Arc<Session>>>,
    generation: AtomicU64,
    dispatcher: RabbitMQDispatcher,
    state: watch::Sender<SupervisorState>,
    closing: watch::Sender<bool>,
    on_fatal: ShutdownHook,
    span: Span,
}

/// Publish/consume client with automatic reconnection.
///
/// Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Connects to the broker, installs the topology and starts supervising the
    /// connection.
    ///
    /// `on_fatal` is invoked when the connection is lost and cannot be
    /// re-established within `max_reconnect` attempts.
    pub async fn new(
        broker: Arc<dyn Broker>,
        config: ClientConfig,
        on_fatal: impl Fn() + Send + Sync + 'static,
    ) -> Result<Client, AmqpError> {
        config.validate()?;

        let client = Client::detached(broker, config, Arc::new(on_fatal));

        if let Err(err) = client.connect().await {
            error!(parent: &client.inner.span, error = err.to_string(), "failure to connect");
            return Err(err);
        }

        if let Err(err) = client.setup().await {
            error!(parent: &client.inner.span, error = err.to_string(), "failure to client setup");
            client.detach().await;
            return Err(err);
        }

        client.spawn_supervisor();

        Ok(client)
    }

    /// Same as [`Client::new`] with the `lapin` driver.
    pub async fn with_lapin(
        config: ClientConfig,
        on_fatal: impl Fn() + Send + Sync + 'static,
    ) -> Result<Client, AmqpError> {
        let broker = Arc::new(LapinBroker::new(&config.connection_name));
        Client::new(broker, config, on_fatal).await
    }

    /// A client that has not connected yet.
    pub(crate) fn detached(
        broker: Arc<dyn Broker>,
        config: ClientConfig,
        on_fatal: ShutdownHook,
    ) -> Client {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        let (closing, _) = watch::channel(false);

        Client {
            inner: Arc::new(Inner {
                broker,
                dispatcher: RabbitMQDispatcher::new(&config),
                config,
                session: RwLock::new(None),
                generation: AtomicU64::new(0),
                state,
                closing,
                on_fatal,
                span: info_span!("rabbitmq", component = "RabbitMQ"),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    /// Follows the supervisor state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    /// Number of successful connects so far; bumped every time a session is installed.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Number of consume registrations re-armed after a reconnect.
    pub async fn consumers(&self) -> usize {
        self.inner.dispatcher.acquire().await.len()
    }

    /// Dials the broker, opens a channel and applies QoS.
    ///
    /// The session is replaced only once all three steps succeeded; a
    /// half-opened connection is closed before the error is returned. Any
    /// session being replaced is torn down first.
    pub(crate) async fn connect(&self) -> Result<(), AmqpError> {
        let cfg = &self.inner.config;

        let connection = self.inner.broker.dial(&cfg.url, DIAL_TIMEOUT).await?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                abandon(connection.as_ref()).await;
                return Err(err);
            }
        };

        if let Err(err) = channel
            .qos(
                cfg.prefetch_count,
                cfg.prefetch_size,
                BasicQosOptions {
                    global: cfg.global_prefetch,
                },
            )
            .await
        {
            abandon(connection.as_ref()).await;
            return Err(err);
        }

        self.detach().await;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.session.write().await = Some(Arc::new(Session {
            generation,
            connection,
            channel,
        }));
        debug!(parent: &self.inner.span, generation, "session installed");

        Ok(())
    }

    /// Declares the exchanges, queues and bindings on the current channel.
    pub(crate) async fn setup(&self) -> Result<(), AmqpError> {
        let session = self
            .session()
            .await
            .ok_or(AmqpError::ChannelNotInitialized)?;

        AmqpTopology::from_config(&self.inner.config)
            .install(session.channel.as_ref())
            .instrument(self.inner.span.clone())
            .await
    }

    /// Publishes `body` to the configured exchange and routing key.
    ///
    /// Fails with `ChannelNotInitialized` without touching the network when no
    /// channel is installed. Failed publishes are not retried.
    pub async fn publish(&self, body: &[u8], headers: Option<&Headers>) -> Result<(), AmqpError> {
        let session = self
            .session()
            .await
            .ok_or(AmqpError::ChannelNotInitialized)?;
        let cfg = &self.inner.config;

        session
            .channel
            .publish(
                &cfg.exchange,
                &cfg.routing_key,
                self.publish_options(),
                body,
                message_properties(&Context::current(), headers, None),
            )
            .await
    }

    /// Publishes `body` through the delayed exchange; the broker routes it once
    /// `delay` (rounded down to whole milliseconds) has elapsed.
    ///
    /// # Parameters
    /// * `body` - The message payload
    /// * `headers` - Optional caller headers; an `x-delay` entry is overwritten
    /// * `delay` - How long the broker holds the message before routing it
    ///
    /// # Returns
    /// `ChannelNotInitialized` without a channel, `DelayedExchangeNotConfigured`
    /// without a delayed exchange, or the driver's publish outcome
    pub async fn publish_delayed(
        &self,
        body: &[u8],
        headers: Option<&Headers>,
        delay: Duration,
    ) -> Result<(), AmqpError> {
        let session = self
            .session()
            .await
            .ok_or(AmqpError::ChannelNotInitialized)?;
        let cfg = &self.inner.config;

        if !cfg.has_delayed_exchange() {
            return Err(AmqpError::DelayedExchangeNotConfigured);
        }

        session
            .channel
            .publish(
                &cfg.delayed_exchange,
                &cfg.routing_key,
                self.publish_options(),
                body,
                message_properties(&Context::current(), headers, Some(delay)),
            )
            .await
    }

    /// Feeds every message of the configured queue to `handler`.
    ///
    /// Messages are acknowledged when the handler succeeds and negatively
    /// acknowledged otherwise. Consumption is re-armed after each reconnect.
    /// Fails with `ChannelOrQueueNotConfigured` while a reconnect is in progress.
    pub async fn consume(&self, handler: Arc<dyn ConsumerHandler>) -> Result<(), AmqpError> {
        let queue = self.inner.config.queue.clone();
        self.consume_queue(&queue, handler).await
    }

    /// [`Client::consume`] bound to the delayed queue.
    pub async fn consume_delayed(
        &self,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        let queue = self.inner.config.delayed_queue.clone();
        self.consume_queue(&queue, handler).await
    }

    async fn consume_queue(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        if queue.is_empty() || self.state() == SupervisorState::Reconnecting {
            return Err(AmqpError::ChannelOrQueueNotConfigured);
        }

        // The session is read under the registrations lock so the supervisor
        // cannot swap channels between the start and the bookkeeping.
        let mut registrations = self.inner.dispatcher.acquire().await;

        let session = self
            .session()
            .await
            .ok_or(AmqpError::ChannelOrQueueNotConfigured)?;

        registrations
            .register(
                session.channel.clone(),
                queue,
                handler,
                self.inner.span.clone(),
            )
            .await
    }

    /// Tears down the channel, then the connection, and stops supervision.
    ///
    /// Closing a client that holds no session is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.closing.send_replace(true);

        let session = self.inner.session.write().await.take();
        let res = match session {
            Some(session) => session.teardown().await,
            None => Ok(()),
        };

        self.inner.dispatcher.acquire().await.clear();

        res
    }

    pub(crate) async fn session(&self) -> Option<Arc<Session>> {
        self.inner.session.read().await.clone()
    }

    /// Removes the current session, if any, and tears it down. Failures are
    /// expected here since the connection is usually already gone.
    pub(crate) async fn detach(&self) {
        let previous = self.inner.session.write().await.take();

        if let Some(previous) = previous {
            if let Err(err) = previous.teardown().await {
                debug!(
                    parent: &self.inner.span,
                    error = err.to_string(),
                    generation = previous.generation,
                    "failure to close replaced session"
                );
            }
        }
    }

    /// Locks the consume registrations; see [`Registrations`].
    pub(crate) async fn registrations(&self) -> Registrations<'_> {
        self.inner.dispatcher.acquire().await
    }

    pub(crate) async fn rearm_consumers(&self, registrations: &mut Registrations<'_>) -> usize {
        match self.session().await {
            Some(session) => {
                registrations
                    .rearm(session.channel.clone(), self.inner.span.clone())
                    .await
            }
            None => 0,
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        *self.inner.closing.borrow()
    }

    /// Resolves once [`Client::close`] has been called.
    pub(crate) async fn closed(&self) {
        let mut closing = self.inner.closing.subscribe();
        let _ = closing.wait_for(|closing| *closing).await;
    }

    pub(crate) fn set_state(&self, state: SupervisorState) {
        self.inner.state.send_replace(state);
    }

    pub(crate) fn signal_fatal(&self) {
        (self.inner.on_fatal)();
    }

    fn spawn_supervisor(&self) {
        tokio::spawn(supervisor::watch(self.clone()).instrument(self.inner.span.clone()));
    }

    fn publish_options(&self) -> BasicPublishOptions {
        BasicPublishOptions {
            mandatory: self.inner.config.mandatory,
            immediate: self.inner.config.immediate,
        }
    }
}

async fn abandon(connection: &dyn BrokerConnection) {
    if let Err(err) = connection.close().await {
        debug!(error = err.to_string(), "failure to close half-opened connection");
    }
}
