// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Graceful Shutdown
//!
//! The coordinator moves the consumer through `Running -> Draining -> Stopped`:
//!
//! - `Running`: deliveries are admitted.
//! - `Draining`: entered on SIGINT/SIGTERM (or [`ShutdownCoordinator::trigger_shutdown`]).
//!   The dispatch loop stops admitting deliveries and the subscription is cancelled.
//!   Tasks already admitted run to their acknowledgment decision; they are never
//!   cancelled.
//! - `Stopped`: every admitted task has finished. Terminal.
//!
//! In-flight tasks are counted with RAII guards, so a panicking task still releases
//! its slot.

use crate::telemetry;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Consumer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Coordinates admission of deliveries and the drain on shutdown.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<ShutdownState>,
}

impl ShutdownCoordinator {
    /// Creates a coordinator in the `Running` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(ShutdownState::Running),
        }
    }

    /// Returns a receiver that flips to `true` once shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> ShutdownState {
        **self.state.load()
    }

    /// Moves to `Draining` and notifies every receiver.
    ///
    /// Only the first call has an effect; a stopped coordinator stays stopped.
    pub fn trigger_shutdown(&self) {
        let prev = self.state.rcu(|state| match **state {
            ShutdownState::Running => Arc::new(ShutdownState::Draining),
            _ => Arc::clone(state),
        });
        if *prev == ShutdownState::Running {
            info!(in_flight = self.in_flight_count(), "shutdown triggered, draining");
        }
        // receivers may have been dropped
        let _ = self.shutdown_signal.send(true);
    }

    /// Waits for SIGINT or SIGTERM, then triggers shutdown.
    pub async fn listen_for_signals(&self) {
        wait_for_signal().await;
        self.trigger_shutdown();
    }

    /// Counts one admitted task until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        let count = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        telemetry::record_in_flight(count);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for the in-flight count to reach zero, for at most `grace`.
    ///
    /// Returns `true` and moves to `Stopped` when every task finished. On timeout a
    /// warning with the outstanding count is logged, the state stays `Draining`, and
    /// `false` is returned.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                self.state.store(Arc::new(ShutdownState::Stopped));
                info!("all in-flight messages settled");
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    outstanding = self.in_flight.load(Ordering::SeqCst),
                    grace_ms = grace.as_millis() as u64,
                    "grace period elapsed with messages still in flight"
                );
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let count = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        telemetry::record_in_flight(count);
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(error = err.to_string(), "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = term.recv() => info!("terminate received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received");
}
