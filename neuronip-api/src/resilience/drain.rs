//! Waits for in-flight work to finish during shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use neuronip_core::{Context, ContextError};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Default interval between active-count checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Drain errors. Both carry the last non-zero active count observed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DrainError {
    #[error("drain timeout: {active} connections still active")]
    TimedOut { active: usize },

    #[error("drain canceled: {active} connections still active")]
    Canceled { active: usize },
}

/// Polls an active-work counter until it reaches zero or time runs out.
#[derive(Debug)]
pub struct ConnectionDrainer {
    drain_timeout: Duration,
    poll_interval: Duration,
    drained: AtomicBool,
}

impl ConnectionDrainer {
    pub fn new(drain_timeout: Duration) -> Self {
        Self::with_poll_interval(drain_timeout, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(drain_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            drain_timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            drained: AtomicBool::new(false),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Whether a previous [`drain`](Self::drain) saw the count reach zero
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    /// Wait until `active_connections` reports zero.
    ///
    /// Bounded by the drain timeout and by `ctx`, whichever ends first. Once
    /// a drain has succeeded, later calls return immediately.
    pub async fn drain<F>(&self, ctx: &Context, active_connections: F) -> Result<(), DrainError>
    where
        F: Fn() -> usize,
    {
        if self.is_drained() {
            return Ok(());
        }

        let (drain_ctx, _cancel) = ctx.with_timeout(self.drain_timeout);
        info!(timeout = ?self.drain_timeout, "draining connections");

        loop {
            let active = active_connections();
            if active == 0 {
                self.drained.store(true, Ordering::SeqCst);
                info!("All connections drained");
                return Ok(());
            }

            debug!(active, "waiting for connections to close");

            tokio::select! {
                reason = drain_ctx.done() => {
                    warn!(active, %reason, "connection drain did not complete");
                    return Err(match reason {
                        ContextError::DeadlineExceeded => DrainError::TimedOut { active },
                        ContextError::Canceled => DrainError::Canceled { active },
                    });
                }
                _ = sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_drain_returns_once_count_reaches_zero() {
        let drainer = ConnectionDrainer::new(Duration::from_secs(5));
        let active = Arc::new(AtomicUsize::new(3));

        let closer = active.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                sleep(Duration::from_millis(150)).await;
                closer.fetch_sub(1, Ordering::SeqCst);
            }
        });

        let start = Instant::now();
        drainer
            .drain(&Context::background(), || active.load(Ordering::SeqCst))
            .await
            .unwrap();

        assert!(drainer.is_drained());
        assert!(start.elapsed() >= Duration::from_millis(450));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_reports_last_count() {
        let drainer = ConnectionDrainer::new(Duration::from_millis(500));

        let result = drainer.drain(&Context::background(), || 7).await;

        assert_eq!(result, Err(DrainError::TimedOut { active: 7 }));
        assert!(!drainer.is_drained());
    }

    #[tokio::test]
    async fn test_drain_is_idempotent() {
        let drainer = ConnectionDrainer::new(Duration::from_millis(50));
        drainer.drain(&Context::background(), || 0).await.unwrap();

        // Already drained: the counter is not consulted again.
        drainer
            .drain(&Context::background(), || unreachable!())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_respects_parent_deadline() {
        let drainer = ConnectionDrainer::new(Duration::from_secs(60));
        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(300));

        let start = Instant::now();
        let result = drainer.drain(&ctx, || 2).await;

        assert_eq!(result, Err(DrainError::TimedOut { active: 2 }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_drain_canceled() {
        let drainer = ConnectionDrainer::new(Duration::from_secs(60));
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();

        let result = drainer.drain(&ctx, || 1).await;
        assert_eq!(result, Err(DrainError::Canceled { active: 1 }));
    }
}
