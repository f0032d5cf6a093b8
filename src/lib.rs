// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! At-least-once order processing over RabbitMQ, with delayed retries through a TTL
//! queue and explicit dead-lettering.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod ingress;
pub mod order;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod shutdown;
pub mod telemetry;
pub mod topology;
