// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module builds the messages the client publishes: caller headers converted
//! to AMQP field values, the OpenTelemetry context of the caller, a fresh message
//! id, the JSON content type and, for delayed messages, the `x-delay` header read
//! by the delayed message plugin.

use crate::otel;
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
        ShortUInt,
    },
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the delivery delay, in milliseconds, for the delayed message plugin
pub const AMQP_HEADERS_DELAY: &str = "x-delay";

/// Caller supplied message headers.
pub type Headers = HashMap<String, HeaderValue>;

/// A header value understood by the AMQP field table encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
    Double(f64),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::LongString(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::LongLongInt(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Uint(v) => AMQPValue::ShortUInt(ShortUInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValue::Double(v) => AMQPValue::Double(v),
        }
    }
}

/// Converts caller headers into the AMQP header table.
fn btree_map(hash_map: &Headers, btree: &mut BTreeMap<ShortString, AMQPValue>) {
    for (key, value) in hash_map {
        btree.insert(ShortString::from(key.as_str()), value.clone().into());
    }
}

/// Whole milliseconds of `delay`, rounded down and saturated to the header range.
pub(crate) fn delay_millis(delay: Duration) -> LongLongInt {
    LongLongInt::try_from(delay.as_millis()).unwrap_or(LongLongInt::MAX)
}

/// Builds the properties of an outgoing message.
///
/// A missing header map is allocated on demand; when `delay` is set the `x-delay`
/// header is added, replacing any value the caller supplied under that key.
///
/// # Parameters
/// * `ctx` - Trace context injected into the headers
/// * `headers` - Optional caller headers
/// * `delay` - Optional delivery delay for the delayed exchange
///
/// # Returns
/// JSON properties with a fresh message id and the merged header table
pub(crate) fn message_properties(
    ctx: &Context,
    headers: Option<&Headers>,
    delay: Option<Duration>,
) -> BasicProperties {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    otel::inject_context(ctx, &mut btree);

    if let Some(headers) = headers {
        btree_map(headers, &mut btree);
    }

    if let Some(delay) = delay {
        btree.insert(
            ShortString::from(AMQP_HEADERS_DELAY),
            AMQPValue::LongLongInt(delay_millis(delay)),
        );
    }

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(btree))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(props: &BasicProperties, key: &str) -> Option<AMQPValue> {
        props
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(key).cloned())
    }

    #[test]
    fn delay_is_rounded_down_to_whole_milliseconds() {
        assert_eq!(delay_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(delay_millis(Duration::from_secs_f64(1.5)), 1500);
        assert_eq!(delay_millis(Duration::from_micros(999)), 0);
        assert_eq!(delay_millis(Duration::MAX), LongLongInt::MAX);
    }

    #[test]
    fn headers_are_allocated_when_missing() {
        let props = message_properties(&Context::new(), None, Some(Duration::from_millis(250)));

        assert_eq!(
            header(&props, AMQP_HEADERS_DELAY),
            Some(AMQPValue::LongLongInt(250))
        );
        assert_eq!(
            props.content_type().as_ref().map(|ct| ct.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert!(props.message_id().is_some());
    }

    #[test]
    fn caller_headers_are_converted_and_delay_wins() {
        let mut headers = Headers::new();
        headers.insert("tenant".to_owned(), "acme".into());
        headers.insert("attempt".to_owned(), HeaderValue::LongInt(2));
        headers.insert(AMQP_HEADERS_DELAY.to_owned(), 10_i64.into());

        let props = message_properties(&Context::new(), Some(&headers), Some(Duration::from_secs(3)));

        assert_eq!(
            header(&props, "tenant"),
            Some(AMQPValue::LongString(LongString::from("acme")))
        );
        assert_eq!(header(&props, "attempt"), Some(AMQPValue::LongInt(2)));
        assert_eq!(
            header(&props, AMQP_HEADERS_DELAY),
            Some(AMQPValue::LongLongInt(3000))
        );
    }

    #[test]
    fn plain_publish_has_no_delay_header() {
        let props = message_properties(&Context::new(), None, None);
        assert_eq!(header(&props, AMQP_HEADERS_DELAY), None);
    }
}
