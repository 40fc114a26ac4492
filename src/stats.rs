//! Connection and line counters shared by every connection task.
//!
//! Provides:
//! - An open-connection gauge maintained by an RAII guard
//! - A received-line counter that the reporter reads and resets each tick
//! - The periodic reporter task

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

/// Process-wide counters, shared behind an `Arc`
#[derive(Debug, Default)]
pub struct Stats {
    /// Number of connection handlers currently running
    connections: AtomicU64,
    /// Lines received since the last sample
    lines: AtomicU64,
}

/// One reading of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub connections: u64,
    pub lines: u64,
}

impl Stats {
    /// Create a new, zeroed counter set
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an open connection.
    ///
    /// The count is released when the returned guard is dropped, so every exit
    /// path of a handler decrements it exactly once.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }

    /// Number of connections currently open
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Count one complete line
    pub fn record_line(&self) {
        self.lines.fetch_add(1, Ordering::SeqCst);
    }

    /// Read the connection gauge and take the line count, resetting it to zero.
    pub fn sample(&self) -> Sample {
        Sample {
            connections: self.connections(),
            lines: self.lines.swap(0, Ordering::SeqCst),
        }
    }
}

/// Keeps a connection counted for as long as it is alive
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: Arc<Stats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Take a sample, returning it only if there is something worth reporting.
///
/// The line counter is reset on every call, idle or not.
pub fn report(stats: &Stats) -> Option<Sample> {
    let sample = stats.sample();
    (sample.connections > 0).then_some(sample)
}

/// Background task that logs the counters once per `period`
pub async fn report_task(stats: Arc<Stats>, period: Duration) {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let Some(sample) = report(&stats) {
            info!(
                connections = sample.connections,
                lines = sample.lines,
                "Connection stats"
            );
        }
    }
}
