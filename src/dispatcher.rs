// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatcher
//!
//! This module subscribes to the main queue and runs one task per delivery.
//!
//! The dispatch loop never waits on a task: it spawns, counts the task as in flight,
//! and goes back to waiting for the next delivery or the shutdown signal. Parallelism
//! is bounded by the broker, which stops delivering once `prefetch` deliveries are
//! unacknowledged. With a prefetch of 1 processing is serial whatever the number of
//! tasks, so the consumer defaults to a larger value.
//!
//! Once shutdown is signalled no further delivery is admitted, even one that is
//! already buffered. Those stay unacknowledged and the broker requeues them when the
//! connection closes.

use crate::{
    consumer::{split_delivery, Acknowledger, InboundMessage, MessageProcessor},
    errors::AmqpError,
    shutdown::ShutdownCoordinator,
};
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why the dispatch loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    /// Shutdown was signalled.
    Shutdown,
    /// The delivery stream ended (consumer cancelled by the broker, channel closed).
    StreamClosed,
}

/// Admits deliveries from `deliveries` until shutdown or the end of the stream.
///
/// Every admitted delivery runs [`MessageProcessor::handle`] on its own task, tracked
/// by the coordinator's in-flight counter. Stream errors are logged and skipped.
/// Returns the number of admitted deliveries with the exit reason.
pub async fn dispatch<S, A>(
    mut deliveries: S,
    processor: Arc<MessageProcessor>,
    coordinator: Arc<ShutdownCoordinator>,
) -> (u64, DispatchExit)
where
    S: Stream<Item = Result<(InboundMessage, A), AmqpError>> + Unpin,
    A: Acknowledger + 'static,
{
    let mut shutdown = coordinator.shutdown_receiver();
    let mut admitted = 0u64;

    loop {
        if *shutdown.borrow_and_update() {
            return (admitted, DispatchExit::Shutdown);
        }

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() {
                    // coordinator dropped, nobody can drain us any more
                    return (admitted, DispatchExit::Shutdown);
                }
            }

            next = deliveries.next() => match next {
                Some(Ok((msg, acker))) => {
                    admitted += 1;
                    let guard = coordinator.in_flight_guard();
                    let processor = Arc::clone(&processor);

                    tokio::spawn(async move {
                        let _guard = guard;
                        let tag = msg.tag;
                        if let Err(err) = processor.handle(msg, acker).await {
                            error!(error = err.to_string(), tag, "error settling msg");
                        }
                    });
                }
                Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                None => {
                    warn!("delivery stream closed");
                    return (admitted, DispatchExit::StreamClosed);
                }
            },
        }
    }
}

/// Subscription settings for the main queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch: u16,
}

/// Consumer of the main queue over a lapin channel.
pub struct OrdersConsumer {
    channel: Arc<Channel>,
    settings: ConsumerSettings,
}

impl OrdersConsumer {
    pub fn new(channel: Arc<Channel>, settings: ConsumerSettings) -> Self {
        OrdersConsumer { channel, settings }
    }

    /// Subscribes with manual acknowledgment and runs the dispatch loop.
    ///
    /// Returns once shutdown is signalled or the subscription ends; the subscription
    /// is cancelled before returning. Draining the admitted tasks is left to the
    /// caller through the coordinator.
    pub async fn run(
        &self,
        processor: Arc<MessageProcessor>,
        coordinator: Arc<ShutdownCoordinator>,
    ) -> Result<DispatchExit, AmqpError> {
        let settings = &self.settings;

        self.channel
            .basic_qos(settings.prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })?;

        let consumer = self
            .channel
            .basic_consume(
                &settings.queue,
                &settings.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(settings.queue.clone())
            })?;

        info!(
            queue = settings.queue,
            tag = settings.consumer_tag,
            prefetch = settings.prefetch,
            "consumer running"
        );

        let deliveries = Box::pin(consumer.map(|result| {
            result
                .map(split_delivery)
                .map_err(|err| AmqpError::ConsumerError(err.to_string()))
        }));

        let (admitted, exit) = dispatch(deliveries, processor, coordinator).await;
        debug!(admitted, ?exit, "dispatch loop finished");

        if exit == DispatchExit::Shutdown {
            self.cancel().await?;
        }

        Ok(exit)
    }

    async fn cancel(&self) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(&self.settings.consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::CancelConsumerError(self.settings.consumer_tag.clone())
            })?;

        info!(tag = self.settings.consumer_tag, "consumer cancelled");
        Ok(())
    }
}
