// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Background task keeping a [`Client`] connected.
//!
//! The supervisor waits for the close notification of the current connection.
//! A graceful close stops it. A lost connection triggers up to `max_reconnect`
//! connect + setup attempts separated by the configured delay; the first
//! success re-arms the consumers and resumes watching the new connection, while
//! exhausting every attempt signals the shutdown hook and ends supervision.
//!
//! The consume registrations stay locked from the moment a loss is detected
//! until the consumers are re-armed, so `consume` calls are ordered either
//! before the old channel goes away or after the new one is ready.

use crate::{
    client::{Client, SupervisorState},
    errors::AmqpError,
};
use tracing::{debug, error, info, warn};

pub(crate) async fn watch(client: Client) {
    loop {
        let Some(session) = client.session().await else {
            debug!("no session to watch");
            client.set_state(SupervisorState::Stopped);
            return;
        };

        let closed = session.connection.notify_close();
        client.set_state(SupervisorState::Watching);
        debug!(generation = session.generation, "watching connection");
        drop(session);

        let reason = match closed.await {
            Ok(Some(reason)) if !client.is_closing() => reason,
            _ => {
                debug!("connection closed gracefully");
                client.set_state(SupervisorState::Stopped);
                return;
            }
        };

        warn!(reason = %reason, "connection closed, reconnecting...");
        client.set_state(SupervisorState::Reconnecting);

        let mut registrations = client.registrations().await;
        client.detach().await;

        let outcome = reconnect(&client).await;

        if client.is_closing() {
            client.detach().await;
            client.set_state(SupervisorState::Stopped);
            return;
        }

        match outcome {
            Ok(attempt) => {
                let consumers = client.rearm_consumers(&mut registrations).await;
                info!(
                    attempt,
                    consumers,
                    generation = client.generation(),
                    "reconnected successfully"
                );
            }
            Err(err) => {
                let attempts = client.config().max_reconnect;
                error!(
                    error = err.to_string(),
                    attempts, "failed to reconnect, giving up"
                );
                client.set_state(SupervisorState::Fatal);
                client.signal_fatal();
                return;
            }
        }
    }
}

/// Runs the bounded retry loop. Returns the successful attempt number, or the
/// error of the last attempt.
async fn reconnect(client: &Client) -> Result<u32, AmqpError> {
    let max = client.config().max_reconnect;
    let delay = client.config().reconnect_delay();
    let mut last = AmqpError::ConnectionError("no reconnect attempt made".to_owned());

    for attempt in 1..=max {
        if client.is_closing() {
            return Err(AmqpError::ConnectionError("client closed".to_owned()));
        }

        match attempt_once(client).await {
            Ok(()) => return Ok(attempt),
            Err(err) => {
                warn!(error = err.to_string(), attempt, max, "reconnect attempt failed");
                last = err;
            }
        }

        if attempt < max {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = client.closed() => {
                    return Err(AmqpError::ConnectionError("client closed".to_owned()));
                }
            }
        }
    }

    Err(last)
}

async fn attempt_once(client: &Client) -> Result<(), AmqpError> {
    client.connect().await?;

    if let Err(err) = client.setup().await {
        client.detach().await;
        return Err(err);
    }

    Ok(())
}
