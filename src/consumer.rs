// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Order Message Processor
//!
//! This module handles one delivery from the main queue, start to finish:
//!
//! 1. Parse the body as an [`Order`]. A body that does not parse is published to the
//!    dead-letter route untouched and acknowledged.
//! 2. Read the `retry-count` header and ask the [`RetryPolicy`] for a decision.
//! 3. Accepted orders are acknowledged. Orders to retry are published to the retry
//!    route with the incremented count, orders out of budget to the dead-letter route;
//!    both are then acknowledged, since the new message owns the next step.
//! 4. When a re-route fails to land, the delivery is negatively acknowledged with
//!    requeue so the broker hands it out again and the decision is taken from scratch.
//!
//! Exactly one acknowledgment decision is sent per delivery. [`MessageProcessor::handle`]
//! takes the acknowledger by value, so a delivery cannot be settled twice.

use crate::{
    errors::AmqpError,
    order::Order,
    otel,
    publisher::{HeaderValue, PublishMessage, Publisher},
    retry::{self, RetryDecision, RetryPolicy, RETRY_COUNT_HEADER},
    telemetry,
    topology::{DEAD_LETTER_QUEUE, ORDERS_EXCHANGE, ORDERS_QUEUE, RETRY_QUEUE},
};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::FieldTable,
};
use opentelemetry::{
    global,
    trace::{FutureExt, Status, TraceContextExt},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, info, warn};

/// Header telling dead-letter consumers why a message ended there
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";
/// Reason set on bodies that are not a valid order
pub const REASON_PAYLOAD_ERROR: &str = "payload-error";
/// Reason set on orders that used up their retries
pub const REASON_RETRY_BUDGET_EXHAUSTED: &str = "retry-budget-exhausted";

/// A delivery as seen by the processor. Read-only once received.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub tag: u64,
    pub redelivered: bool,
    pub headers: FieldTable,
    pub data: Vec<u8>,
}

impl InboundMessage {
    pub fn new(tag: u64, data: Vec<u8>) -> Self {
        InboundMessage {
            tag,
            redelivered: false,
            headers: FieldTable::default(),
            data,
        }
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }
}

/// Sends the terminal acknowledgment decision for one delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Marks the delivery as handled; the broker drops it.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Marks the delivery as not handled; with `requeue` the broker delivers it again.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Acknowledger backed by lapin's per-delivery acker.
pub struct DeliveryAcker {
    tag: u64,
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for DeliveryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), tag = self.tag, "error whiling ack msg");
                AmqpError::AckMessageError(self.tag)
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), tag = self.tag, "error whiling nack msg");
                AmqpError::NackMessageError(self.tag)
            })
    }
}

/// Splits a lapin delivery into the message and its acknowledger.
pub fn split_delivery(delivery: Delivery) -> (InboundMessage, DeliveryAcker) {
    let tag = delivery.delivery_tag;
    let message = InboundMessage {
        tag,
        redelivered: delivery.redelivered,
        headers: delivery.properties.headers().clone().unwrap_or_default(),
        data: delivery.data,
    };

    (
        message,
        DeliveryAcker {
            tag,
            acker: delivery.acker,
        },
    )
}

/// What happened to a delivery that was processed to the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// The order passed the business rule.
    Accepted,
    /// The order was sent to the retry queue carrying `retry_count`.
    Retried { retry_count: u32 },
    /// The order used up its retries and was sent to the dead-letter queue.
    DeadLettered { retry_count: u32 },
    /// The body was not an order and was sent to the dead-letter queue.
    Rejected(String),
}

/// The acknowledgment decision sent for a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledged after reaching `ProcessingOutcome`.
    Acked(ProcessingOutcome),
    /// Negatively acknowledged with requeue because a re-route failed.
    Requeued(AmqpError),
}

/// Applies the retry policy to deliveries and re-routes them.
pub struct MessageProcessor {
    publisher: Arc<dyn Publisher>,
    policy: RetryPolicy,
}

impl MessageProcessor {
    /// Creates a processor with the default policy.
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        MessageProcessor {
            publisher,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Processes `msg` and sends exactly one acknowledgment decision through `acker`.
    ///
    /// Returns the decision sent, or the error of the ack/nack call itself. In the
    /// latter case the broker redelivers the message once the channel closes.
    pub async fn handle<A>(&self, msg: InboundMessage, acker: A) -> Result<Settlement, AmqpError>
    where
        A: Acknowledger,
    {
        let settlement = match self.process(&msg).await {
            Ok(outcome) => {
                acker.ack().await?;
                Settlement::Acked(outcome)
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    tag = msg.tag,
                    "re-route failed, requeuing message"
                );
                acker.nack(true).await?;
                Settlement::Requeued(err)
            }
        };

        telemetry::record_settlement(&settlement);
        Ok(settlement)
    }

    /// Parses, decides and re-routes `msg` without settling it.
    ///
    /// An error means a required publish did not land; the delivery must be requeued.
    pub async fn process(&self, msg: &InboundMessage) -> Result<ProcessingOutcome, AmqpError> {
        let cx = otel::consumer_context(
            &msg.headers,
            &global::tracer("orders consumer"),
            ORDERS_QUEUE,
        );

        let result = self.route(msg).with_context(cx.clone()).await;

        let span = cx.span();
        match &result {
            Ok(ProcessingOutcome::Rejected(reason)) => {
                span.set_status(Status::Error {
                    description: Cow::from(reason.clone()),
                });
            }
            Ok(_) => span.set_status(Status::Ok),
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
        span.end();

        result
    }

    async fn route(&self, msg: &InboundMessage) -> Result<ProcessingOutcome, AmqpError> {
        debug!(
            tag = msg.tag,
            redelivered = msg.redelivered,
            broker_deaths = retry::broker_death_count(&msg.headers),
            "received order message"
        );

        let order = match Order::from_slice(&msg.data) {
            Ok(order) => order,
            Err(err) => {
                let reason = err.to_string();
                error!(tag = msg.tag, error = reason, "invalid payload, sending to dlq");

                let dead = PublishMessage::new(ORDERS_EXCHANGE, DEAD_LETTER_QUEUE, msg.data.clone())
                    .header(
                        DEAD_LETTER_REASON_HEADER,
                        HeaderValue::Str(REASON_PAYLOAD_ERROR.to_owned()),
                    );
                self.publisher.publish(&dead).await?;

                return Ok(ProcessingOutcome::Rejected(reason));
            }
        };

        let count = retry::retry_count(&msg.headers);

        match self.policy.decide(&order, count) {
            RetryDecision::Accept => {
                info!(order_id = order.id, value = order.value, "order processed");
                Ok(ProcessingOutcome::Accepted)
            }
            RetryDecision::Retry { next_retry_count } => {
                warn!(
                    order_id = order.id,
                    retry_count = next_retry_count,
                    "order rejected by business rule, scheduling retry"
                );

                let retry = PublishMessage::new(ORDERS_EXCHANGE, RETRY_QUEUE, msg.data.clone())
                    .header(RETRY_COUNT_HEADER, retry::retry_count_value(next_retry_count));
                self.publisher.publish(&retry).await?;

                Ok(ProcessingOutcome::Retried {
                    retry_count: next_retry_count,
                })
            }
            RetryDecision::DeadLetter { retry_count } => {
                error!(
                    order_id = order.id,
                    retry_count, "too many attempts, sending to dlq"
                );

                let dead = PublishMessage::new(ORDERS_EXCHANGE, DEAD_LETTER_QUEUE, msg.data.clone())
                    .header(RETRY_COUNT_HEADER, retry::retry_count_value(retry_count))
                    .header(
                        DEAD_LETTER_REASON_HEADER,
                        HeaderValue::Str(REASON_RETRY_BUDGET_EXHAUSTED.to_owned()),
                    );
                self.publisher.publish(&dead).await?;

                Ok(ProcessingOutcome::DeadLettered { retry_count })
            }
        }
    }
}
