// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use anyhow::{bail, Context};
use clap::Parser;
use order_pipeline::{
    channel::AmqpSession,
    config::ConsumerConfig,
    consumer::MessageProcessor,
    dispatcher::{DispatchExit, OrdersConsumer},
    publisher::AmqpPublisher,
    shutdown::ShutdownCoordinator,
    telemetry,
    topology::AmqpTopology,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ConsumerConfig::parse();
    telemetry::init_tracing(cfg.broker.log_json);

    if let Err(err) = telemetry::install_metrics_exporter(cfg.metrics_addr) {
        warn!(error = err.to_string(), "metrics exporter disabled");
    }

    let session = AmqpSession::open(
        &cfg.broker.rabbitmq_url,
        "order-consumer",
        cfg.broker.connect_policy(),
    )
    .await
    .context("cannot connect to the broker")?;

    AmqpTopology::orders(session.consume_channel.clone())
        .install()
        .await
        .context("cannot declare the orders topology")?;

    let publisher = AmqpPublisher::new(session.publish_channel.clone());
    let processor = Arc::new(MessageProcessor::new(publisher));
    let coordinator = Arc::new(ShutdownCoordinator::new());

    tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.listen_for_signals().await }
    });

    telemetry::set_consumer_running(true);

    let consumer = OrdersConsumer::new(session.consume_channel.clone(), cfg.consumer_settings());
    let exit = consumer.run(processor, Arc::clone(&coordinator)).await;

    // a closed subscription drains the same way a signal does
    coordinator.trigger_shutdown();
    if !coordinator.wait_for_drain(cfg.shutdown_grace()).await {
        warn!(
            outstanding = coordinator.in_flight_count(),
            "exiting with unsettled messages, the broker will redeliver them"
        );
    }

    telemetry::set_consumer_running(false);
    session.close().await;

    match exit {
        Ok(DispatchExit::Shutdown) => {
            info!("shutdown complete");
            Ok(())
        }
        Ok(DispatchExit::StreamClosed) => bail!("subscription closed by the broker"),
        Err(err) => {
            error!(error = err.to_string(), "consumer failed");
            Err(err.into())
        }
    }
}
