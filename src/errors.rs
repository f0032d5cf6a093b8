// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Order Pipeline
//!
//! This module provides the error taxonomy for every broker-facing operation of the
//! pipeline: connecting, declaring the topology, subscribing, publishing re-routes and
//! settling deliveries. Per-delivery errors are never fatal; they are turned into an
//! acknowledgment decision by the processor. Only connection and topology errors abort
//! the process.

use thiserror::Error;

/// Represents errors that can occur while talking to RabbitMQ.
///
/// Each variant carries the name of the entity involved (queue, exchange, route or
/// delivery tag) so a log line is enough to locate the failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring the prefetch limit
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error subscribing to a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a subscription
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message to the given route
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// The broker refused the publish on the given route
    #[error("publish to `{0}` was not confirmed by the broker")]
    PublishNotConfirmed(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging the delivery with the given tag
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging the delivery with the given tag
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// Error receiving a delivery from the subscription
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
