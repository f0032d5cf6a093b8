// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Types describing the exchanges the pipeline declares. A definition is plain data;
//! [`crate::topology::AmqpTopology`] turns it into an `exchange.declare` call.
//!
//! Every order route is an exact routing-key match, so exchanges are always declared
//! with the direct type.

/// Definition of a direct RabbitMQ exchange.
///
/// ```
/// use order_pipeline::exchange::ExchangeDefinition;
///
/// let def = ExchangeDefinition::new("orders.exchange").durable();
/// assert!(def.is_durable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a non-durable exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}
