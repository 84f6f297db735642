// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module settles every delivered message according to the outcome of the
//! caller supplied handler: a successful handler acknowledges the message, a
//! failing one negatively acknowledges it with the configured requeue policy.
//! Handler failures never escape as client errors. Each delivery is processed
//! inside an OpenTelemetry consumer span.

use crate::{driver::Delivery, errors::AmqpError, otel};
use async_trait::async_trait;
use lapin::types::FieldTable;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

#[cfg(test)]
use mockall::automock;

/// A delivered message as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub data: Vec<u8>,
    pub headers: Option<FieldTable>,
}

/// Business logic applied to every message of a queue.
///
/// Returning `Ok` acknowledges the message; returning `Err` nacks it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}

/// Runs the handler for one delivery and settles it.
///
/// Exactly one ack or one nack is sent per delivery. An error is returned only
/// when the settlement itself could not be sent.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    queue: &str,
    mut delivery: Delivery,
    handler: &dyn ConsumerHandler,
    requeue_on_failure: bool,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, queue);

    debug!(queue, size = delivery.data.len(), "message received");

    let msg = ConsumerMessage {
        queue: queue.to_owned(),
        data: std::mem::take(&mut delivery.data),
        headers: delivery.properties.headers().clone(),
    };

    match handler.exec(&ctx, &msg).await {
        Ok(()) => {
            debug!("message successfully processed");
            match delivery.ack().await {
                Err(e) => {
                    error!("error whiling ack msg");
                    span.record_error(&e);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(e)
                }
                _ => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
            }
        }
        Err(err) => {
            warn!(
                error = err.to_string(),
                requeue = requeue_on_failure,
                "error whiling handling msg, rejecting"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });

            delivery.nack(requeue_on_failure).await.inspect_err(|_| {
                error!("error whiling nack msg");
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockAcknowledger;
    use lapin::BasicProperties;
    use mockall::predicate::eq;

    fn delivery(acker: MockAcknowledger) -> Delivery {
        Delivery::new(
            b"{\"id\":1}".to_vec(),
            BasicProperties::default(),
            Box::new(acker),
        )
    }

    fn tracer() -> BoxedTracer {
        opentelemetry::global::tracer("amqp consumer")
    }

    #[tokio::test]
    async fn success_acks_exactly_once() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().times(0);

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .withf(|_, msg| msg.queue == "orders" && msg.data == b"{\"id\":1}")
            .times(1)
            .returning(|_, _| Ok(()));

        let res = consume(&tracer(), "orders", delivery(acker), &handler, false).await;
        assert_eq!(res, Ok(()));
    }

    #[tokio::test]
    async fn failure_nacks_without_requeue_by_default() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(0);
        acker
            .expect_nack()
            .with(eq(false))
            .times(1)
            .returning(|_| Ok(()));

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_, _| Err(AmqpError::ConsumerError("invalid payload".to_owned())));

        let res = consume(&tracer(), "orders", delivery(acker), &handler, false).await;
        assert_eq!(res, Ok(()));
    }

    #[tokio::test]
    async fn failure_requeues_when_configured() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(0);
        acker
            .expect_nack()
            .with(eq(true))
            .times(1)
            .returning(|_| Ok(()));

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_, _| Err(AmqpError::ConsumerError("downstream busy".to_owned())));

        let res = consume(&tracer(), "orders", delivery(acker), &handler, true).await;
        assert_eq!(res, Ok(()));
    }

    #[tokio::test]
    async fn ack_failure_is_reported() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|| Err(AmqpError::AckMessageError));
        acker.expect_nack().times(0);

        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().returning(|_, _| Ok(()));

        let res = consume(&tracer(), "orders", delivery(acker), &handler, false).await;
        assert_eq!(res, Err(AmqpError::AckMessageError));
    }
}
