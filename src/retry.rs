// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! The decision taken for every parsed order, and the `retry-count` header that carries
//! the attempt number between redelivery cycles.
//!
//! The header is owned by the processor: it is absent on the first delivery, and every
//! re-route through the retry queue writes the previous value plus one. The broker's own
//! `x-death` history is read for diagnostics only and never feeds a decision.

use crate::{order::Order, publisher::HeaderValue};
use lapin::types::{AMQPValue, FieldTable};

/// Header carrying the number of times an order went through the retry queue
pub const RETRY_COUNT_HEADER: &str = "retry-count";
/// Header set by the broker when it dead-letters a message
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Count field inside an `x-death` entry
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Orders whose value is above this amount are sent back for another attempt
pub const VALUE_THRESHOLD: f64 = 1000.0;
/// Number of retry cycles an order gets before it is dead-lettered
pub const MAX_RETRIES: u32 = 3;

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The order passes the business rule.
    Accept,
    /// The order must be attempted again with `next_retry_count`.
    Retry { next_retry_count: u32 },
    /// The retry budget is spent; `retry_count` is the last attempt number.
    DeadLetter { retry_count: u32 },
}

/// Business rule applied to every order.
///
/// Deterministic and free of side effects; the processor performs the I/O the
/// decision calls for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    threshold: f64,
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            threshold: VALUE_THRESHOLD,
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(threshold: f64, max_retries: u32) -> Self {
        RetryPolicy {
            threshold,
            max_retries,
        }
    }

    /// Decides what happens to `order` on its `retry_count`-th retry cycle.
    pub fn decide(&self, order: &Order, retry_count: u32) -> RetryDecision {
        if order.value <= self.threshold {
            return RetryDecision::Accept;
        }

        if retry_count < self.max_retries {
            RetryDecision::Retry {
                next_retry_count: retry_count + 1,
            }
        } else {
            RetryDecision::DeadLetter { retry_count }
        }
    }
}

/// Reads the `retry-count` header.
///
/// Any integer encoding is accepted, as is a decimal string. A missing, negative or
/// unreadable value counts as a first delivery; a value past `u32::MAX` saturates so
/// the count never goes back down.
pub fn retry_count(headers: &FieldTable) -> u32 {
    let Some(value) = headers.inner().get(RETRY_COUNT_HEADER) else {
        return 0;
    };

    let count: Option<i64> = match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::ShortString(v) => v.as_str().trim().parse().ok(),
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse().ok()),
        _ => None,
    };

    match count {
        Some(c) if c > 0 => u32::try_from(c).unwrap_or(u32::MAX),
        _ => 0,
    }
}

/// Encodes a retry count for the `retry-count` header.
pub fn retry_count_value(count: u32) -> HeaderValue {
    HeaderValue::Int(i64::from(count))
}

/// Reads the broker's dead-letter count from the first `x-death` entry.
pub fn broker_death_count(headers: &FieldTable) -> i64 {
    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|entry| entry.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|count| count.as_long_long_int())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{FieldArray, LongString, ShortString};

    fn headers(value: AMQPValue) -> FieldTable {
        let mut table = FieldTable::default();
        table.insert(ShortString::from(RETRY_COUNT_HEADER), value);
        table
    }

    #[test]
    fn small_orders_are_accepted_whatever_the_count() {
        let policy = RetryPolicy::default();
        let order = Order::new("a", 500.0);
        assert_eq!(policy.decide(&order, 0), RetryDecision::Accept);
        assert_eq!(policy.decide(&order, 7), RetryDecision::Accept);
    }

    #[test]
    fn threshold_itself_is_accepted() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&Order::new("a", VALUE_THRESHOLD), 0),
            RetryDecision::Accept
        );
    }

    #[test]
    fn large_orders_walk_the_retry_budget() {
        let policy = RetryPolicy::default();
        let order = Order::new("a", 1500.0);

        let mut count = 0;
        while let RetryDecision::Retry { next_retry_count } = policy.decide(&order, count) {
            assert_eq!(next_retry_count, count + 1);
            count = next_retry_count;
        }

        assert_eq!(count, MAX_RETRIES);
        assert_eq!(
            policy.decide(&order, count),
            RetryDecision::DeadLetter {
                retry_count: MAX_RETRIES
            }
        );
    }

    #[test]
    fn counts_past_the_budget_are_dead_lettered() {
        let policy = RetryPolicy::new(10.0, 1);
        assert_eq!(
            policy.decide(&Order::new("a", 11.0), 5),
            RetryDecision::DeadLetter { retry_count: 5 }
        );
    }

    #[test]
    fn missing_header_counts_as_zero() {
        assert_eq!(retry_count(&FieldTable::default()), 0);
    }

    #[test]
    fn integer_encodings_are_read() {
        assert_eq!(retry_count(&headers(AMQPValue::ShortShortUInt(1))), 1);
        assert_eq!(retry_count(&headers(AMQPValue::ShortInt(2))), 2);
        assert_eq!(retry_count(&headers(AMQPValue::LongInt(3))), 3);
        assert_eq!(retry_count(&headers(retry_count_value(4).into())), 4);
    }

    #[test]
    fn string_encodings_are_read() {
        assert_eq!(
            retry_count(&headers(AMQPValue::LongString(LongString::from("2")))),
            2
        );
        assert_eq!(
            retry_count(&headers(AMQPValue::ShortString(ShortString::from(" 3 ")))),
            3
        );
    }

    #[test]
    fn unreadable_or_negative_values_count_as_zero() {
        assert_eq!(retry_count(&headers(AMQPValue::LongLongInt(-2))), 0);
        assert_eq!(
            retry_count(&headers(AMQPValue::LongString(LongString::from("many")))),
            0
        );
        assert_eq!(retry_count(&headers(AMQPValue::Boolean(true))), 0);
    }

    #[test]
    fn oversized_values_saturate() {
        let past_u32 = i64::from(u32::MAX) + 1;
        assert_eq!(retry_count(&headers(AMQPValue::LongLongInt(past_u32))), u32::MAX);
        let as_text = AMQPValue::LongString(LongString::from(past_u32.to_string()));
        assert_eq!(retry_count(&headers(as_text)), u32::MAX);

        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&Order::new("a", 1500.0), u32::MAX),
            RetryDecision::DeadLetter {
                retry_count: u32::MAX
            }
        );
    }

    #[test]
    fn broker_death_count_reads_first_entry() {
        let mut death = FieldTable::default();
        death.insert(ShortString::from(AMQP_HEADERS_COUNT), AMQPValue::LongLongInt(4));

        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])),
        );

        assert_eq!(broker_death_count(&table), 4);
        assert_eq!(broker_death_count(&FieldTable::default()), 0);
    }

    #[test]
    fn broker_history_does_not_feed_the_retry_count() {
        let mut death = FieldTable::default();
        death.insert(ShortString::from(AMQP_HEADERS_COUNT), AMQPValue::LongLongInt(9));

        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])),
        );

        assert_eq!(retry_count(&table), 0);
    }
}
