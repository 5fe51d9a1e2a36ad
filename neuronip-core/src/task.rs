//! Stoppable periodic background loops.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::context::{CancelHandle, Context};

const MIN_PERIOD: Duration = Duration::from_millis(1);
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A background loop that runs `tick` every `period` until its context ends
/// or [`PeriodicTask::stop`] is called. Dropping the task cancels it.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    cancel: Option<CancelHandle>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn the loop on the current tokio runtime. The first tick fires one
    /// full period after spawning.
    pub fn spawn<F, Fut>(parent: &Context, name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.clamp(MIN_PERIOD, MAX_PERIOD);
        let (ctx, cancel) = parent.with_cancel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    reason = ctx.done() => {
                        debug!(task = name, %reason, "periodic task stopping");
                        break;
                    }
                    _ = ticker.tick() => tick().await,
                }
            }
        });

        debug!(task = name, ?period, "periodic task started");

        Self {
            name,
            cancel: Some(cancel),
            handle: Some(handle),
        }
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel the loop and wait for it to exit. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(task = self.name, error = %err, "periodic task ended abnormally");
            }
        }
    }
}
