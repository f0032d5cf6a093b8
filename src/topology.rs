// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Orders Topology
//!
//! This module declares the broker entities the pipeline runs on:
//!
//! | Entity | Name | Arguments |
//! |---|---|---|
//! | Exchange | `orders.exchange` | direct, durable |
//! | Main queue | `orders.created` | durable |
//! | Retry queue | `orders.retry` | durable, ttl 5000 ms, dead-letters to `orders.created` |
//! | Dead-letter queue | `orders.dlq` | durable |
//!
//! Every queue is bound to the exchange under its own name. The retry queue has no
//! consumer: its messages expire after the TTL and the broker dead-letters them back
//! onto the main route, which makes it a fixed-delay retry loop.
//!
//! Declarations are idempotent, so both the producer and the consumer install the
//! topology at startup. Any failure is returned to the caller, which treats it as fatal.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Exchange every order route is bound to
pub const ORDERS_EXCHANGE: &str = "orders.exchange";
/// Main queue, consumed by the order processor
pub const ORDERS_QUEUE: &str = "orders.created";
/// Delay queue holding orders until their next attempt
pub const RETRY_QUEUE: &str = "orders.retry";
/// Queue receiving orders that will never be processed
pub const DEAD_LETTER_QUEUE: &str = "orders.dlq";
/// Time an order waits in the retry queue before it is re-delivered
pub const RETRY_DELAY_MS: i32 = 5000;

/// The broker operations needed to install a topology.
///
/// Implemented for [`lapin::Channel`]; tests substitute a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TopologyDeclarer: Send + Sync {
    /// Declares the exchange, succeeding if it already exists with the same settings.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares the queue, succeeding if it already exists with the same arguments.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;
}

#[async_trait]
impl TopologyDeclarer for Channel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.exchange_declare(
            &def.name,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                passive: false,
                durable: def.durable,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            AmqpError::DeclareExchangeError(def.name.clone())
        })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.queue_declare(
            &def.name,
            QueueDeclareOptions {
                passive: false,
                durable: def.durable,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            def.field_table(),
        )
        .await
        .map(|_| ())
        .map_err(|err| {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the queue"
            );
            AmqpError::DeclareQueueError(def.name.clone())
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            )
        })
    }
}

/// A set of exchanges, queues and bindings installed in one pass.
pub struct AmqpTopology {
    declarer: Arc<dyn TopologyDeclarer>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    /// Creates an empty topology that declares through `declarer`.
    pub fn new(declarer: Arc<dyn TopologyDeclarer>) -> AmqpTopology {
        AmqpTopology {
            declarer,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Creates the orders topology: one direct exchange, the main, retry and
    /// dead-letter queues, and a binding per queue keyed by the queue name.
    pub fn orders(declarer: Arc<dyn TopologyDeclarer>) -> AmqpTopology {
        let mut topology = AmqpTopology::new(declarer)
            .exchange(ExchangeDefinition::new(ORDERS_EXCHANGE).durable())
            .queue(QueueDefinition::new(ORDERS_QUEUE).durable())
            .queue(
                QueueDefinition::new(RETRY_QUEUE)
                    .durable()
                    .ttl(RETRY_DELAY_MS)
                    .dead_letter_to(ORDERS_EXCHANGE, ORDERS_QUEUE),
            )
            .queue(QueueDefinition::new(DEAD_LETTER_QUEUE).durable());

        for queue in [ORDERS_QUEUE, RETRY_QUEUE, DEAD_LETTER_QUEUE] {
            topology = topology.queue_binding(
                QueueBinding::new(queue)
                    .exchange(ORDERS_EXCHANGE)
                    .routing_key(queue),
            );
        }

        topology
    }

    /// Adds an exchange definition.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues_binding
    }

    /// Installs the topology on the broker.
    ///
    /// Exchanges are declared first, then queues, then bindings, so every binding
    /// refers to entities that already exist. The first failure stops the install.
    pub async fn install(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.declarer.declare_exchange(exch).await?;
        }

        for queue in &self.queues {
            debug!("creating queue: {}", queue.name);
            self.declarer.declare_queue(queue).await?;
        }

        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.declarer.bind_queue(binding).await?;
        }

        info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.queues_binding.len(),
            "topology installed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn permissive() -> MockTopologyDeclarer {
        let mut declarer = MockTopologyDeclarer::new();
        declarer.expect_declare_exchange().returning(|_| Ok(()));
        declarer.expect_declare_queue().returning(|_| Ok(()));
        declarer.expect_bind_queue().returning(|_| Ok(()));
        declarer
    }

    #[test]
    fn orders_topology_entities() {
        let topology = AmqpTopology::orders(Arc::new(permissive()));

        let exchanges = topology.exchanges();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].name(), ORDERS_EXCHANGE);
        assert!(exchanges[0].is_durable());

        let names: Vec<&str> = topology.queues().iter().map(|q| q.name()).collect();
        assert_eq!(names, vec![ORDERS_QUEUE, RETRY_QUEUE, DEAD_LETTER_QUEUE]);
        assert!(topology.queues().iter().all(|q| q.is_durable()));

        // only the delay queue carries arguments
        assert!(topology.queues()[0].arguments().is_empty());
        assert_eq!(topology.queues()[1].arguments().len(), 3);
        assert!(topology.queues()[2].arguments().is_empty());
    }

    #[test]
    fn every_queue_is_bound_by_its_own_name() {
        let topology = AmqpTopology::orders(Arc::new(permissive()));

        assert_eq!(topology.bindings().len(), 3);
        for binding in topology.bindings() {
            assert_eq!(binding.exchange_name(), ORDERS_EXCHANGE);
            assert_eq!(binding.key(), binding.queue_name());
        }
    }

    #[test]
    fn retry_queue_expires_into_main_route() {
        let topology = AmqpTopology::orders(Arc::new(permissive()));
        let retry = &topology.queues()[1];

        assert_eq!(retry.ttl, Some(RETRY_DELAY_MS));
        assert_eq!(retry.dead_letter_exchange.as_deref(), Some(ORDERS_EXCHANGE));
        assert_eq!(retry.dead_letter_routing_key.as_deref(), Some(ORDERS_QUEUE));
    }

    #[tokio::test]
    async fn install_declares_in_dependency_order() {
        let mut seq = Sequence::new();
        let mut declarer = MockTopologyDeclarer::new();

        declarer
            .expect_declare_exchange()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        declarer
            .expect_declare_queue()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        declarer
            .expect_bind_queue()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let topology = AmqpTopology::orders(Arc::new(declarer));
        assert_eq!(topology.install().await, Ok(()));
    }

    #[tokio::test]
    async fn install_can_be_repeated() {
        let topology = AmqpTopology::orders(Arc::new(permissive()));
        assert!(topology.install().await.is_ok());
        assert!(topology.install().await.is_ok());
    }

    #[tokio::test]
    async fn install_stops_at_first_failure() {
        let mut declarer = MockTopologyDeclarer::new();
        declarer.expect_declare_exchange().returning(|_| Ok(()));
        declarer.expect_declare_queue().returning(|def| {
            if def.name() == RETRY_QUEUE {
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            } else {
                Ok(())
            }
        });
        declarer.expect_bind_queue().never();

        let topology = AmqpTopology::orders(Arc::new(declarer));
        assert_eq!(
            topology.install().await,
            Err(AmqpError::DeclareQueueError(RETRY_QUEUE.to_owned()))
        );
    }
}
