//! Expiry sweeper - background timeout enforcement
//!
//! Periodically transitions overdue pending requests to expired. Each
//! individual expiry goes through the same conditional-update path as
//! interactive transitions, so a request approved microseconds earlier
//! simply loses the race and is skipped. Overlapping ticks are safe for
//! the same reason.

use crate::engine::ApprovalEngine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Default sweep interval
const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Periodic background sweep over pending requests
pub struct ExpirySweeper {
    engine: Arc<ApprovalEngine>,
    interval: Duration,
}

impl ExpirySweeper {
    /// Create a sweeper with the default 5-minute interval
    pub fn new(engine: Arc<ApprovalEngine>) -> Self {
        Self {
            engine,
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Override the sweep interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one sweep now
    pub fn tick(&self) -> usize {
        match self.engine.sweep_expired(Utc::now()) {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "Expiry sweep failed");
                0
            }
        }
    }

    /// Run the sweep loop forever (spawn this on the runtime)
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; that is fine, sweeping an
        // empty set is a no-op.
        loop {
            ticker.tick().await;
            tracing::debug!("Running expiry sweep");
            self.tick();
        }
    }
}
