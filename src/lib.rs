// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod dispatcher;
mod otel;
mod supervisor;

pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod driver;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use client::{Client, ShutdownHook, SupervisorState};
pub use config::ClientConfig;
pub use consumer::{ConsumerHandler, ConsumerMessage};
pub use errors::AmqpError;
pub use publisher::{HeaderValue, Headers};
