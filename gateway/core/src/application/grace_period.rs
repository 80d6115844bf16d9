// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lock Recovery Grace Period
//!
//! After a restart, clients get a window to reclaim the locks and share
//! reservations they held before. While the window is open only reclaim
//! requests are honoured.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct GracePeriod {
    active: Arc<AtomicBool>,
    duration: Duration,
}

impl GracePeriod {
    /// A zero duration never opens the window.
    pub fn new(duration: Duration) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(!duration.is_zero())),
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Close the window now
    pub fn end_now(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Lock grace period ended");
        }
    }

    /// Schedule the end of the window. Cancelling `shutdown` stops the timer
    /// and leaves the flag as it is.
    pub fn start(&self, shutdown: CancellationToken) {
        if !self.is_active() {
            return;
        }
        info!("Lock grace period started ({}s)", self.duration.as_secs());
        let grace = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(grace.duration) => grace.end_now(),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_duration_is_inactive() {
        assert!(!GracePeriod::new(Duration::ZERO).is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_closes_after_duration() {
        let grace = GracePeriod::new(Duration::from_secs(50));
        grace.start(CancellationToken::new());
        assert!(grace.is_active());

        tokio::time::sleep(Duration::from_secs(49)).await;
        assert!(grace.is_active());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!grace.is_active());
    }

    #[test]
    fn test_end_now() {
        let grace = GracePeriod::new(Duration::from_secs(50));
        grace.end_now();
        assert!(!grace.is_active());
    }
}
