// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Session Management
//!
//! This module establishes the broker connection and the two channels the pipeline
//! uses: one to consume and settle deliveries, one to publish. Connecting is retried
//! with a fixed delay up to a bounded number of attempts; running out of attempts is
//! fatal for the caller.

use crate::errors::AmqpError;
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// Fixed-delay retry budget for connecting to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        ConnectPolicy {
            attempts: 10,
            delay: Duration::from_secs(3),
        }
    }
}

/// Runs `connect` until it succeeds or `policy.attempts` attempts have failed.
///
/// Waits `policy.delay` between attempts. At least one attempt is always made.
pub async fn connect_with_retry<T, E, F, Fut>(
    policy: ConnectPolicy,
    mut connect: F,
) -> Result<T, AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        match connect().await {
            Ok(conn) => {
                debug!(attempt, "amqp connected");
                return Ok(conn);
            }
            Err(err) if attempt < attempts => {
                warn!(
                    error = err.to_string(),
                    attempt,
                    attempts,
                    "failure to connect, retrying in {:?}",
                    policy.delay
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => {
                error!(error = err.to_string(), attempts, "failure to connect, giving up");
            }
        }
    }

    Err(AmqpError::ConnectionError)
}

/// One broker connection with a consume channel and a publish channel.
///
/// The publish channel runs in publisher-confirm mode. Share the session through
/// [`Arc`] clones of its fields rather than through globals.
pub struct AmqpSession {
    pub connection: Arc<Connection>,
    pub consume_channel: Arc<Channel>,
    pub publish_channel: Arc<Channel>,
}

impl AmqpSession {
    /// Connects to `uri` (retrying per `policy`) and opens both channels.
    ///
    /// `name` is shown as the connection name in the broker's management UI.
    pub async fn open(
        uri: &str,
        name: &str,
        policy: ConnectPolicy,
    ) -> Result<AmqpSession, AmqpError> {
        debug!("creating amqp connection...");

        let connection = connect_with_retry(policy, || {
            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(name.to_owned()));
            Connection::connect(uri, options)
        })
        .await?;

        let consume_channel = create_channel(&connection).await?;
        let publish_channel = create_channel(&connection).await?;

        publish_channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ChannelError
            })?;

        info!(connection = name, "amqp session opened");

        Ok(AmqpSession {
            connection: Arc::new(connection),
            consume_channel: Arc::new(consume_channel),
            publish_channel: Arc::new(publish_channel),
        })
    }

    /// Closes the connection. Unacknowledged deliveries return to their queue.
    pub async fn close(&self) {
        if let Err(err) = self.connection.close(200, "shutdown").await {
            warn!(error = err.to_string(), "error closing amqp connection");
        }
    }
}

async fn create_channel(conn: &Connection) -> Result<Channel, AmqpError> {
    debug!("creating amqp channel...");
    conn.create_channel().await.map_err(|err| {
        error!(error = err.to_string(), "error to create the channel");
        AmqpError::ChannelError
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let policy = ConnectPolicy {
            attempts: 5,
            delay: Duration::from_millis(100),
        };

        let result = connect_with_retry(policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err("refused")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = ConnectPolicy {
            attempts: 4,
            delay: Duration::from_secs(1),
        };
        let started = tokio::time::Instant::now();

        let result: Result<(), AmqpError> = connect_with_retry(policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("refused") }
        })
        .await;

        assert_eq!(result, Err(AmqpError::ConnectionError));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // no wait after the last attempt
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);
        let policy = ConnectPolicy {
            attempts: 0,
            delay: Duration::from_secs(1),
        };

        let result = connect_with_retry(policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, &str>("conn") }
        })
        .await;

        assert_eq!(result, Ok("conn"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
