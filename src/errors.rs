// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! This module provides the error type shared by every layer of the client.
//! The `AmqpError` enum groups transport failures (dial, channel, QoS), topology
//! failures (declare and bind), precondition failures returned synchronously to
//! publishers and consumers, and the handler failures that turn into a nack.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Transport and topology errors raised while the reconnect supervisor is
/// retrying never reach callers; they are logged and counted as failed attempts.
/// Precondition errors are always returned to the caller that triggered the
/// operation and are never retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The configuration cannot be used to build a client
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos: {0}")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// No channel is installed, either before the first connect or while reconnecting
    #[error("channel not initialized")]
    ChannelNotInitialized,

    /// A delayed publish was requested but no delayed exchange is configured
    #[error("delayed exchange not configured")]
    DelayedExchangeNotConfigured,

    /// A consume was requested without a channel or without a queue to consume from
    #[error("channel or queue not configured")]
    ChannelOrQueueNotConfigured,

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer on `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error returned by a consumer handler
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error tearing down a channel or a connection
    #[error("failure to close: {0}")]
    CloseError(String),
}
