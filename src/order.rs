// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Order payload carried as the message body.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};

/// An order as published by the producer: `{"id": string, "value": number}`.
///
/// A missing field takes its zero value (empty id, value 0); only a field of the
/// wrong type or a body that is not a JSON object is malformed. Orders are not
/// deduplicated; two messages with the same `id` are two orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub value: f64,
}

impl Order {
    pub fn new(id: impl Into<String>, value: f64) -> Self {
        Order {
            id: id.into(),
            value,
        }
    }

    /// Decodes an order from a JSON message body.
    pub fn from_slice(data: &[u8]) -> Result<Order, AmqpError> {
        serde_json::from_slice(data).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// Encodes the order as a JSON message body.
    pub fn to_vec(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}
