// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use anyhow::Context;
use clap::Parser;
use order_pipeline::{
    channel::AmqpSession, config::ProducerConfig, ingress, publisher::AmqpPublisher,
    shutdown::ShutdownCoordinator, telemetry, topology::AmqpTopology,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ProducerConfig::parse();
    telemetry::init_tracing(cfg.broker.log_json);

    if let Err(err) = telemetry::install_metrics_exporter(cfg.metrics_addr) {
        warn!(error = err.to_string(), "metrics exporter disabled");
    }

    let session = AmqpSession::open(
        &cfg.broker.rabbitmq_url,
        "order-producer",
        cfg.broker.connect_policy(),
    )
    .await
    .context("cannot connect to the broker")?;

    AmqpTopology::orders(session.publish_channel.clone())
        .install()
        .await
        .context("cannot declare the orders topology")?;

    let app = ingress::router(AmqpPublisher::new(session.publish_channel.clone()));

    let listener = tokio::net::TcpListener::bind(cfg.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http_addr))?;
    info!(addr = %cfg.http_addr, "producer listening");

    telemetry::set_producer_running(true);

    let coordinator = Arc::new(ShutdownCoordinator::new());
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.listen_for_signals().await }
        })
        .await
        .context("http server failed")?;

    telemetry::set_producer_running(false);
    session.close().await;
    info!("producer stopped");
    Ok(())
}
