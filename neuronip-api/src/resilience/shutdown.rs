//! Graceful shutdown coordination for the application.
//!
//! [`ShutdownManager`] holds an ordered list of named cleanup hooks. The first
//! call to [`ShutdownManager::shutdown`] flips the shutting-down flag, notifies
//! every [`ShutdownManager::shutdown_channel`] subscriber, and runs all hooks
//! concurrently under one deadline. Later or concurrent callers get
//! [`ShutdownError::AlreadyInProgress`] straight away.
//!
//! Hooks registered after shutdown has started are not run.
//!
//! # Example
//!
//! ```no_run
//! use neuronip_api::resilience::shutdown::{ShutdownManager, ShutdownSignal};
//! use neuronip_core::Context;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ShutdownManager::new(Duration::from_secs(30));
//!
//! manager.register_hook("flush", |_ctx: Context| async {
//!     println!("Flushing buffers...");
//!     Ok(())
//! });
//!
//! ShutdownSignal::new().wait().await;
//! manager.shutdown(&Context::background()).await?;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use futures::FutureExt;
use neuronip_core::{Context, ContextError};
use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::ApiError;

/// Shutdown signal handler
#[derive(Clone)]
pub struct ShutdownSignal {
    triggered: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        let (triggered, _) = watch::channel(false);
        Self {
            triggered: Arc::new(triggered),
        }
    }

    /// Wait for SIGINT, SIGTERM, or a manual [`trigger`](Self::trigger)
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(err) = signal::ctrl_c().await {
                error!(error = %err, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    error!(error = %err, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let mut manual = self.triggered.subscribe();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
            _ = manual.wait_for(|triggered| *triggered) => {
                info!("Shutdown triggered manually");
            }
        }

        self.triggered.send_replace(true);
    }

    /// Check if shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.triggered.borrow()
    }

    /// Manually trigger shutdown
    pub fn trigger(&self) {
        self.triggered.send_replace(true);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A hook that returned an error or panicked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub hook: String,
    pub message: String,
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.hook, self.message)
    }
}

/// Shutdown errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShutdownError {
    /// Another caller already started shutdown
    #[error("Shutdown already in progress")]
    AlreadyInProgress,

    /// Every hook finished, some with errors
    #[error("Shutdown hooks failed: {}", format_failures(.0))]
    HookFailures(Vec<HookFailure>),

    /// Hooks were still running when the deadline passed. Carries the
    /// effective budget, which is shorter than the manager's timeout when
    /// the caller's deadline came first.
    #[error("Shutdown timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's context was cancelled before hooks finished
    #[error("Shutdown canceled")]
    Canceled,
}

fn format_failures(failures: &[HookFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

type HookFn = Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct ShutdownHook {
    name: String,
    run: HookFn,
}

struct ManagerState {
    hooks: Vec<ShutdownHook>,
    shutting_down: bool,
}

/// Runs registered cleanup hooks concurrently under one deadline
pub struct ShutdownManager {
    timeout: Duration,
    state: Mutex<ManagerState>,
    started: watch::Sender<bool>,
}

impl ShutdownManager {
    /// Create a new shutdown manager
    pub fn new(timeout: Duration) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            timeout,
            state: Mutex::new(ManagerState {
                hooks: Vec::new(),
                shutting_down: false,
            }),
            started,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a named shutdown hook.
    ///
    /// Each hook receives a context that ends when the shutdown deadline
    /// passes; long-running hooks should observe it.
    pub fn register_hook<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut state = self.state.lock();
        if state.shutting_down {
            warn!(hook = %name, "shutdown hook registered after shutdown started; it will not run");
            return;
        }

        debug!(hook = %name, "registered shutdown hook");
        state.hooks.push(ShutdownHook {
            name,
            run: Arc::new(move |ctx| hook(ctx).boxed()),
        });
    }

    /// Names of registered hooks, in registration order
    pub fn hook_names(&self) -> Vec<String> {
        self.state.lock().hooks.iter().map(|hook| hook.name.clone()).collect()
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Receiver whose value turns `true` once shutdown starts
    pub fn shutdown_channel(&self) -> watch::Receiver<bool> {
        self.started.subscribe()
    }

    /// Wait until shutdown starts
    pub async fn started(&self) {
        let mut rx = self.started.subscribe();
        // The sender lives as long as `self`, so this only ends once started.
        let _ = rx.wait_for(|started| *started).await;
    }

    /// Run every registered hook concurrently, bounded by the manager's
    /// timeout and by `ctx`.
    ///
    /// Returns `Ok(())` when all hooks succeed and
    /// [`ShutdownError::HookFailures`] when all finished but some failed. If
    /// the deadline passes first, returns [`ShutdownError::Timeout`] without
    /// waiting for the remaining hooks; their context is cancelled and their
    /// tasks are aborted.
    pub async fn shutdown(&self, ctx: &Context) -> Result<(), ShutdownError> {
        let hooks: Vec<(String, HookFn)> = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return Err(ShutdownError::AlreadyInProgress);
            }
            state.shutting_down = true;
            state
                .hooks
                .iter()
                .map(|hook| (hook.name.clone(), hook.run.clone()))
                .collect()
        };
        self.started.send_replace(true);

        info!(hooks = hooks.len(), timeout = ?self.timeout, "starting graceful shutdown");

        let (bounded, cancel) = ctx.with_timeout(self.timeout);
        let budget = bounded.remaining().unwrap_or(self.timeout);
        let mut pending = BTreeMap::new();
        let mut tasks = JoinSet::new();

        for (index, (name, run)) in hooks.into_iter().enumerate() {
            let hook_ctx = bounded.clone();
            pending.insert(index, name);
            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(run(hook_ctx)).catch_unwind().await;
                (index, outcome)
            });
        }

        let mut failures = Vec::new();
        let interrupted = loop {
            tokio::select! {
                biased;
                joined = tasks.join_next() => match joined {
                    None => break None,
                    Some(Ok((index, outcome))) => {
                        let hook = pending.remove(&index).unwrap_or_default();
                        let message = match outcome {
                            Ok(Ok(())) => {
                                debug!(%hook, "shutdown hook completed");
                                continue;
                            }
                            Ok(Err(err)) => format!("{:#}", err),
                            Err(panic) => format!("hook panicked: {}", panic_message(&*panic)),
                        };
                        warn!(%hook, error = %message, "shutdown hook failed");
                        failures.push(HookFailure { hook, message });
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "shutdown hook task ended abnormally");
                    }
                },
                reason = bounded.done() => break Some(reason),
            }
        };

        if let Some(reason) = interrupted {
            let unfinished: Vec<&String> = pending.values().collect();
            warn!(?unfinished, %reason, "shutdown hooks did not complete in time");

            cancel.cancel();
            tasks.abort_all();

            return Err(match reason {
                ContextError::DeadlineExceeded => ShutdownError::Timeout(budget),
                ContextError::Canceled => ShutdownError::Canceled,
            });
        }

        if failures.is_empty() {
            info!("Graceful shutdown completed");
            Ok(())
        } else {
            Err(ShutdownError::HookFailures(failures))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Counts in-flight requests
#[derive(Debug, Clone, Default)]
pub struct RequestTracker {
    active: Arc<AtomicUsize>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of in-flight requests
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Count one request until the returned guard is dropped
    pub fn track(&self) -> RequestGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            active: self.active.clone(),
        }
    }
}

/// Guard that tracks one in-flight request
#[derive(Debug)]
pub struct RequestGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Admission gate that stops taking new requests once shutdown starts
#[derive(Clone)]
pub struct RequestGate {
    shutdown: Arc<ShutdownManager>,
    tracker: RequestTracker,
}

impl RequestGate {
    pub fn new(shutdown: Arc<ShutdownManager>, tracker: RequestTracker) -> Self {
        Self { shutdown, tracker }
    }

    /// Track a new request, or `None` if shutdown has started
    pub fn admit(&self) -> Option<RequestGuard> {
        // Count first so a drain that starts concurrently never misses us.
        let guard = self.tracker.track();
        if self.shutdown.is_shutting_down() {
            None
        } else {
            Some(guard)
        }
    }
}

/// Axum middleware that tracks in-flight requests and answers 503 once
/// shutdown has started
pub async fn track_requests(State(gate): State<RequestGate>, req: Request, next: Next) -> Response {
    let Some(_guard) = gate.admit() else {
        return ApiError::ServiceUnavailable("Server is shutting down".to_string()).into_response();
    };
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use tokio::time::{sleep, Instant};

    #[test]
    fn test_shutdown_signal_manual_trigger() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());

        signal.trigger();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_shutdown_signal_wait_returns_on_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        signal.trigger();
        handle.await.unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks_run_concurrently() {
        let manager = ShutdownManager::new(Duration::from_secs(2));
        let counter = Arc::new(AtomicU32::new(0));

        for name in ["first", "second"] {
            let counter = counter.clone();
            manager.register_hook(name, move |_ctx| {
                let counter = counter.clone();
                async move {
                    sleep(Duration::from_millis(500)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        let start = Instant::now();
        manager.shutdown(&Context::background()).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_hook_times_out() {
        let manager = ShutdownManager::new(Duration::from_secs(2));
        manager.register_hook("slow", |_ctx| async {
            sleep(Duration::from_secs(3)).await;
            Ok(())
        });

        let start = Instant::now();
        let result = manager.shutdown(&Context::background()).await;

        assert!(matches!(result, Err(ShutdownError::Timeout(t)) if t == Duration::from_secs(2)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_context_carries_shutdown_deadline() {
        let manager = ShutdownManager::new(Duration::from_millis(100));
        let (remaining_tx, remaining_rx) = watch::channel(None);

        manager.register_hook("observer", move |ctx: Context| {
            let remaining_tx = remaining_tx.clone();
            async move {
                remaining_tx.send_replace(ctx.remaining());
                Ok(())
            }
        });

        manager.shutdown(&Context::background()).await.unwrap();

        let remaining = remaining_rx.borrow().unwrap();
        assert!(remaining <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_hook_errors_are_aggregated() {
        let manager = ShutdownManager::new(Duration::from_secs(5));
        manager.register_hook("ok", |_ctx| async { Ok(()) });
        manager.register_hook("db", |_ctx| async { Err(anyhow::anyhow!("pool still busy")) });
        manager.register_hook("panicky", |_ctx| async {
            if true {
                panic!("boom");
            }
            Ok(())
        });

        let result = manager.shutdown(&Context::background()).await;

        let mut failures = match result {
            Err(ShutdownError::HookFailures(failures)) => failures,
            other => panic!("expected hook failures, got {:?}", other),
        };
        failures.sort_by(|a, b| a.hook.cmp(&b.hook));

        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].hook, "db");
        assert_eq!(failures[0].message, "pool still busy");
        assert_eq!(failures[1].hook, "panicky");
        assert!(failures[1].message.contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_shutdown_runs_hooks_once() {
        let manager = Arc::new(ShutdownManager::new(Duration::from_secs(5)));
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        manager.register_hook("count", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(200)).await;
                Ok(())
            }
        });

        let ctx = Context::background();
        let (first, second) = tokio::join!(manager.shutdown(&ctx), manager.shutdown(&ctx));

        let results = [first, second];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(ShutdownError::AlreadyInProgress)))
            .count();

        assert_eq!(ok, 1);
        assert_eq!(rejected, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_channel_and_flag() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        let mut channel = manager.shutdown_channel();

        assert!(!manager.is_shutting_down());
        assert!(!*channel.borrow());

        manager.shutdown(&Context::background()).await.unwrap();

        assert!(manager.is_shutting_down());
        channel.changed().await.unwrap();
        assert!(*channel.borrow());
        manager.started().await;

        assert!(matches!(
            manager.shutdown(&Context::background()).await,
            Err(ShutdownError::AlreadyInProgress)
        ));
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let manager = ShutdownManager::new(Duration::from_secs(60));
        manager.register_hook("forever", |_ctx: Context| async move {
            std::future::pending::<()>().await;
            Ok(())
        });

        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();

        let result = manager.shutdown(&ctx).await;
        assert!(matches!(result, Err(ShutdownError::Canceled)));
    }

    #[tokio::test]
    async fn test_no_hooks_with_cancelled_caller_succeeds() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();

        assert!(manager.shutdown(&ctx).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_caller_deadline_when_shorter() {
        let manager = ShutdownManager::new(Duration::from_secs(60));
        manager.register_hook("slow", |_ctx| async {
            sleep(Duration::from_secs(10)).await;
            Ok(())
        });

        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_secs(1));
        let result = manager.shutdown(&ctx).await;

        assert!(matches!(result, Err(ShutdownError::Timeout(t)) if t == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_hook_registered_by_running_hook_is_skipped() {
        let manager = Arc::new(ShutdownManager::new(Duration::from_secs(5)));
        let late_ran = Arc::new(AtomicBool::new(false));

        let registrar = manager.clone();
        let flag = late_ran.clone();
        manager.register_hook("registrar", move |_ctx| {
            let registrar = registrar.clone();
            let flag = flag.clone();
            async move {
                registrar.register_hook("late", move |_ctx| {
                    let flag = flag.clone();
                    async move {
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                });
                Ok(())
            }
        });

        assert!(manager.shutdown(&Context::background()).await.is_ok());
        assert!(!late_ran.load(Ordering::SeqCst));
        assert_eq!(manager.hook_names(), vec!["registrar"]);
    }

    #[tokio::test]
    async fn test_hook_registered_after_shutdown_never_runs() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        let late_ran = Arc::new(AtomicBool::new(false));

        assert!(manager.shutdown(&Context::background()).await.is_ok());

        let flag = late_ran.clone();
        manager.register_hook("late", move |_ctx| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        assert!(matches!(
            manager.shutdown(&Context::background()).await,
            Err(ShutdownError::AlreadyInProgress)
        ));
        assert!(!late_ran.load(Ordering::SeqCst));
        assert!(manager.hook_names().is_empty());
    }

    #[test]
    fn test_hook_names_in_order() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        manager.register_hook("drain", |_ctx| async { Ok(()) });
        manager.register_hook("cache", |_ctx| async { Ok(()) });

        assert_eq!(manager.hook_names(), vec!["drain", "cache"]);
    }

    #[test]
    fn test_request_tracker_guard() {
        let tracker = RequestTracker::new();
        assert_eq!(tracker.active(), 0);

        let first = tracker.track();
        let second = tracker.track();
        assert_eq!(tracker.active(), 2);

        drop(first);
        assert_eq!(tracker.active(), 1);
        drop(second);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_gate_rejects_during_shutdown() {
        let manager = Arc::new(ShutdownManager::new(Duration::from_secs(1)));
        let tracker = RequestTracker::new();
        let gate = RequestGate::new(manager.clone(), tracker.clone());

        let guard = gate.admit();
        assert!(guard.is_some());
        assert_eq!(tracker.active(), 1);

        manager.shutdown(&Context::background()).await.unwrap();

        assert!(gate.admit().is_none());
        assert_eq!(tracker.active(), 1);
        drop(guard);
        assert_eq!(tracker.active(), 0);
    }
}
