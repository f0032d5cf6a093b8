// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module sends messages to a route on an exchange. Both the producer's HTTP
//! handler and the consumer's re-routing go through the [`Publisher`] trait.
//!
//! [`AmqpPublisher`] owns the single outbound channel. Concurrent tasks share it, so
//! every publish takes an exclusive gate first and holds it until the broker has
//! confirmed the message: sends never interleave on the channel.

use crate::{errors::AmqpError, otel};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, Channel,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Content type set on every published message
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A header value attached to a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
        }
    }
}

/// A message ready to be sent: destination, body and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub headers: HashMap<String, HeaderValue>,
}

impl PublishMessage {
    /// Creates a message for `routing_key` on `exchange` without headers.
    pub fn new(exchange: &str, routing_key: &str, data: Vec<u8>) -> Self {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data,
            headers: HashMap::default(),
        }
    }

    /// Adds a header.
    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }
}

/// Sends messages to the broker.
///
/// A returned error means the message may not have reached its queue; callers must
/// not treat the send as done.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, msg: &PublishMessage) -> Result<(), AmqpError>;
}

/// The raw send step behind [`AmqpPublisher`]: one message out, resolved once the
/// broker has confirmed it.
#[async_trait]
pub trait ConfirmedSender: Send + Sync {
    async fn send_confirmed(
        &self,
        msg: &PublishMessage,
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;
}

#[async_trait]
impl ConfirmedSender for Channel {
    async fn send_confirmed(
        &self,
        msg: &PublishMessage,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.data,
                properties,
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    route = msg.routing_key,
                    "error publishing message"
                );
                AmqpError::PublishingError(msg.routing_key.clone())
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(
                error = err.to_string(),
                route = msg.routing_key,
                "error waiting for publish confirmation"
            );
            AmqpError::PublishingError(msg.routing_key.clone())
        })?;

        if confirmation.is_nack() {
            error!(route = msg.routing_key, "broker refused the message");
            return Err(AmqpError::PublishNotConfirmed(msg.routing_key.clone()));
        }

        Ok(())
    }
}

/// Publisher over a lapin channel, serialized through one gate.
///
/// The channel should be in confirm mode (see
/// [`crate::channel::AmqpSession::open`]); a broker nack is then reported as
/// [`AmqpError::PublishNotConfirmed`].
pub struct AmqpPublisher<S = Channel> {
    sender: Arc<S>,
    gate: Mutex<()>,
}

impl AmqpPublisher {
    pub fn new(channel: Arc<Channel>) -> Arc<AmqpPublisher> {
        AmqpPublisher::with_sender(channel)
    }
}

impl<S: ConfirmedSender> AmqpPublisher<S> {
    pub fn with_sender(sender: Arc<S>) -> Arc<AmqpPublisher<S>> {
        Arc::new(AmqpPublisher {
            sender,
            gate: Mutex::new(()),
        })
    }
}

#[async_trait]
impl<S: ConfirmedSender> Publisher for AmqpPublisher<S> {
    async fn publish(&self, msg: &PublishMessage) -> Result<(), AmqpError> {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_current(&mut btree);
        headers_btree(&msg.headers, &mut btree);

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree));

        let _gate = self.gate.lock().await;
        self.sender.send_confirmed(msg, properties).await?;

        debug!(exchange = msg.exchange, route = msg.routing_key, "message published");
        Ok(())
    }
}

/// Copies message headers into an AMQP header table.
fn headers_btree(
    headers: &HashMap<String, HeaderValue>,
    btree: &mut BTreeMap<ShortString, AMQPValue>,
) {
    for (key, value) in headers {
        btree.insert(ShortString::from(key.as_str()), value.clone().into());
    }
}
