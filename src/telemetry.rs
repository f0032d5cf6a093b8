// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging and Metrics
//!
//! Process-wide tracing subscriber setup, the Prometheus exporter, and the metric
//! names recorded at each outcome point. Recording a metric never influences a
//! decision; without an installed recorder the calls are no-ops.

use crate::consumer::{
    ProcessingOutcome, Settlement, REASON_PAYLOAD_ERROR, REASON_RETRY_BUDGET_EXHAUSTED,
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const ORDERS_PROCESSED: &str = "orders_processed_total";
pub const ORDERS_RETRIED: &str = "orders_retried_total";
pub const ORDERS_DEAD_LETTERED: &str = "orders_dead_lettered_total";
pub const ORDERS_REQUEUED: &str = "orders_requeued_total";
pub const CONSUMER_RUNNING: &str = "orders_consumer_running";
pub const IN_FLIGHT: &str = "orders_in_flight";

pub const HTTP_REQUESTS: &str = "orders_http_requests_total";
pub const PUBLISH_SUCCESS: &str = "orders_publish_success_total";
pub const PUBLISH_ERROR: &str = "orders_publish_error_total";
pub const HTTP_REQUEST_SECONDS: &str = "orders_http_request_seconds";
pub const PRODUCER_RUNNING: &str = "orders_producer_running";

/// Initializes the tracing subscriber for the process.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. With `json` set, logs are
/// emitted as one JSON object per line. Later calls are no-ops.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Installs the Prometheus recorder and serves `/metrics` on `addr`.
///
/// Must be called from inside a tokio runtime.
pub fn install_metrics_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    describe_counter!(ORDERS_PROCESSED, "Orders accepted by the business rule");
    describe_counter!(ORDERS_RETRIED, "Orders sent to the retry queue");
    describe_counter!(ORDERS_DEAD_LETTERED, "Messages sent to the dead-letter queue");
    describe_counter!(ORDERS_REQUEUED, "Deliveries requeued after a failed re-route");
    describe_gauge!(CONSUMER_RUNNING, "1 while the consumer is running");
    describe_gauge!(IN_FLIGHT, "Deliveries being processed");
    describe_counter!(HTTP_REQUESTS, "HTTP requests received");
    describe_counter!(PUBLISH_SUCCESS, "Orders published by the producer");
    describe_counter!(PUBLISH_ERROR, "Orders the producer failed to publish");
    describe_histogram!(HTTP_REQUEST_SECONDS, "HTTP request duration");
    describe_gauge!(PRODUCER_RUNNING, "1 while the producer is running");

    info!(%addr, "metrics exposed on /metrics");
    Ok(())
}

/// Records the counters matching an acknowledgment decision.
pub fn record_settlement(settlement: &Settlement) {
    match settlement {
        Settlement::Acked(ProcessingOutcome::Accepted) => {
            counter!(ORDERS_PROCESSED).increment(1);
        }
        Settlement::Acked(ProcessingOutcome::Retried { .. }) => {
            counter!(ORDERS_RETRIED).increment(1);
        }
        Settlement::Acked(ProcessingOutcome::DeadLettered { .. }) => {
            counter!(ORDERS_DEAD_LETTERED, "reason" => REASON_RETRY_BUDGET_EXHAUSTED).increment(1);
        }
        Settlement::Acked(ProcessingOutcome::Rejected(_)) => {
            counter!(ORDERS_DEAD_LETTERED, "reason" => REASON_PAYLOAD_ERROR).increment(1);
        }
        Settlement::Requeued(_) => {
            counter!(ORDERS_REQUEUED).increment(1);
        }
    }
}

/// Publishes the in-flight count.
pub fn record_in_flight(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!(IN_FLIGHT).set(count as f64);
}

/// Flags the consumer as running or stopped.
pub fn set_consumer_running(running: bool) {
    gauge!(CONSUMER_RUNNING).set(if running { 1.0 } else { 0.0 });
}

/// Flags the producer as running or stopped.
pub fn set_producer_running(running: bool) {
    gauge!(PRODUCER_RUNNING).set(if running { 1.0 } else { 0.0 });
}
