// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and creating RabbitMQ topology components.
//! The topology includes exchanges, queues, and the bindings between them, plus the optional
//! delayed exchange/queue pair served by the delayed message plugin.
//!
//! Installation is idempotent on the broker side: declaring an identical exchange or queue
//! twice is a no-op, so the reconnect supervisor simply replays the whole topology on every
//! attempt. Nothing is rolled back when a step fails.

use crate::{
    config::ClientConfig,
    driver::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use tracing::{debug, error};

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology on a live channel.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology on the RabbitMQ server through `channel`.
    async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Derives the topology described by a client configuration.
    ///
    /// - the primary exchange is declared when its name is set
    /// - the primary queue is declared when its name is set, and bound only when
    ///   both the exchange and the routing key are set as well
    /// - the delayed exchange is declared when its name is set, and the delayed
    ///   queue is declared and bound to it when that name is set too
    pub fn from_config(cfg: &ClientConfig) -> AmqpTopology {
        let mut topology = AmqpTopology::new();

        if !cfg.exchange.is_empty() {
            topology = topology.exchange(
                ExchangeDefinition::new(&cfg.exchange)
                    .kind(cfg.exchange_type.clone())
                    .durable(cfg.durable)
                    .delete(cfg.auto_delete)
                    .internal(cfg.internal)
                    .no_wait(cfg.no_wait),
            );
        }

        if !cfg.queue.is_empty() {
            topology = topology.queue(queue_definition(&cfg.queue, cfg));

            if !cfg.exchange.is_empty() && !cfg.routing_key.is_empty() {
                topology = topology.queue_binding(
                    QueueBinding::new(&cfg.queue)
                        .exchange(&cfg.exchange)
                        .routing_key(&cfg.routing_key)
                        .no_wait(cfg.no_wait),
                );
            }
        }

        if cfg.has_delayed_exchange() {
            topology = topology.exchange(
                ExchangeDefinition::new(&cfg.delayed_exchange)
                    .delayed(&cfg.delayed_type)
                    .durable(cfg.durable)
                    .delete(cfg.auto_delete)
                    .internal(cfg.internal)
                    .no_wait(cfg.no_wait),
            );

            if !cfg.delayed_queue.is_empty() {
                topology = topology
                    .queue(queue_definition(&cfg.delayed_queue, cfg))
                    .queue_binding(
                        QueueBinding::new(&cfg.delayed_queue)
                            .exchange(&cfg.delayed_exchange)
                            .routing_key(&cfg.routing_key)
                            .no_wait(cfg.no_wait),
                    );
            }
        }

        topology
    }
}

fn queue_definition(name: &str, cfg: &ClientConfig) -> QueueDefinition {
    QueueDefinition::new(name)
        .durable(cfg.durable)
        .delete(cfg.auto_delete)
        .exclusive(cfg.exclusive)
        .no_wait(cfg.no_wait)
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchange(channel).await?;
        self.install_queue(channel).await?;
        self.binding_queues(channel).await
    }
}

impl AmqpTopology {
    async fn install_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = channel.exchange_declare(exch).await {
                error!(
                    error = err.to_string(),
                    name = %exch.name,
                    "error to declare the exchange"
                );
                return Err(err);
            }

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Err(err) = channel.queue_declare(def).await {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the queue"
                );
                return Err(err);
            }

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            if let Err(err) = channel.queue_bind(binding).await {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{driver::MockBrokerChannel, exchange::ExchangeKind};

    fn config() -> ClientConfig {
        ClientConfig {
            url: "amqp://localhost".to_owned(),
            exchange: "orders".to_owned(),
            exchange_type: ExchangeKind::Topic,
            queue: "orders.created".to_owned(),
            routing_key: "orders.created".to_owned(),
            durable: true,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn empty_exchange_name_skips_exchange_and_binding() {
        let topology = AmqpTopology::from_config(&ClientConfig {
            exchange: String::new(),
            ..config()
        });

        assert!(topology.exchanges.is_empty());
        assert_eq!(topology.queues.len(), 1);
        assert!(topology.queues_binding.is_empty());
    }

    #[test]
    fn empty_queue_name_skips_queue_and_binding() {
        let topology = AmqpTopology::from_config(&ClientConfig {
            queue: String::new(),
            ..config()
        });

        assert_eq!(topology.exchanges.len(), 1);
        assert!(topology.queues.is_empty());
        assert!(topology.queues_binding.is_empty());
    }

    #[test]
    fn binding_requires_exchange_and_routing_key() {
        let without_key = AmqpTopology::from_config(&ClientConfig {
            routing_key: String::new(),
            ..config()
        });
        assert!(without_key.queues_binding.is_empty());

        let full = AmqpTopology::from_config(&config());
        assert_eq!(
            full.queues_binding,
            vec![QueueBinding::new("orders.created")
                .exchange("orders")
                .routing_key("orders.created")]
        );
    }

    #[test]
    fn delayed_pair_is_added_when_configured() {
        let topology = AmqpTopology::from_config(&ClientConfig {
            delayed_exchange: "orders.delayed".to_owned(),
            delayed_queue: "orders.delayed.q".to_owned(),
            ..config()
        });

        assert_eq!(topology.exchanges.len(), 2);
        assert_eq!(
            topology.exchanges[1].exchange_kind(),
            &ExchangeKind::XMessageDelayed
        );
        assert_eq!(topology.queues[1].name(), "orders.delayed.q");
        assert_eq!(topology.queues_binding[1].exchange_name(), "orders.delayed");
    }

    #[test]
    fn delayed_queue_without_delayed_exchange_is_ignored() {
        let topology = AmqpTopology::from_config(&ClientConfig {
            delayed_queue: "orders.delayed.q".to_owned(),
            ..config()
        });

        assert_eq!(topology.exchanges.len(), 1);
        assert_eq!(topology.queues.len(), 1);
    }

    #[tokio::test]
    async fn install_without_exchange_never_declares_one() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_exchange_declare().times(0);
        channel
            .expect_queue_declare()
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_queue_bind().times(0);

        let topology = AmqpTopology::from_config(&ClientConfig {
            exchange: String::new(),
            ..config()
        });

        assert_eq!(topology.install(&channel).await, Ok(()));
    }

    #[tokio::test]
    async fn install_without_queue_never_declares_or_binds_one() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_exchange_declare()
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_queue_declare().times(0);
        channel.expect_queue_bind().times(0);

        let topology = AmqpTopology::from_config(&ClientConfig {
            queue: String::new(),
            ..config()
        });

        assert_eq!(topology.install(&channel).await, Ok(()));
    }

    #[tokio::test]
    async fn install_stops_at_first_failure() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_exchange_declare()
            .times(1)
            .returning(|def| {
                Err(AmqpError::DeclareExchangeError(
                    def.name().to_owned(),
                    "PRECONDITION_FAILED".to_owned(),
                ))
            });
        channel.expect_queue_declare().times(0);
        channel.expect_queue_bind().times(0);

        let res = AmqpTopology::from_config(&config()).install(&channel).await;

        assert_eq!(
            res,
            Err(AmqpError::DeclareExchangeError(
                "orders".to_owned(),
                "PRECONDITION_FAILED".to_owned()
            ))
        );
    }
}
