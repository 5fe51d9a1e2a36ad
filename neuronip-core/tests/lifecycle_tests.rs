//! Integration tests for contexts, periodic tasks and clocks working together

use neuronip_core::{Clock, Context, ContextError, ManualClock, PeriodicTask};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[tokio::test(start_paused = true)]
async fn test_periodic_task_ends_at_context_deadline() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(350));

    let counter = ticks.clone();
    let task = PeriodicTask::spawn(&ctx, "bounded", Duration::from_millis(100), move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let start = Instant::now();
    assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
    assert!(start.elapsed() >= Duration::from_millis(350));
    assert!(start.elapsed() < Duration::from_millis(400));

    sleep(Duration::from_secs(1)).await;
    assert!(!task.is_running());
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancelling_parent_ends_whole_tree() {
    let (parent, cancel) = Context::background().with_cancel();
    let (child, _child_cancel) = parent.with_timeout(Duration::from_secs(60));
    let (grandchild, _grandchild_cancel) = child.with_cancel();

    cancel.cancel();

    assert_eq!(grandchild.err(), Some(ContextError::Canceled));
    assert_eq!(child.err(), Some(ContextError::Canceled));
}

#[tokio::test]
async fn test_dropping_handle_cancels_context() {
    let (ctx, cancel) = Context::background().with_cancel();
    assert!(!ctx.is_done());

    drop(cancel);
    assert_eq!(ctx.err(), Some(ContextError::Canceled));
}

#[tokio::test(start_paused = true)]
async fn test_run_drops_slow_future_at_deadline() {
    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(50));

    let result = ctx
        .run(async {
            sleep(Duration::from_secs(5)).await;
            "finished"
        })
        .await;

    assert_eq!(result, Err(ContextError::DeadlineExceeded));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_task_stops_with_parent_context() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let (root, cancel) = Context::background().with_cancel();

    let counter = ticks.clone();
    let task = PeriodicTask::spawn(&root, "counter", Duration::from_millis(100), move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    sleep(Duration::from_millis(350)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 3);

    cancel.cancel();
    sleep(Duration::from_millis(10)).await;
    assert!(!task.is_running());

    sleep(Duration::from_millis(500)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_task_advances_manual_clock() {
    let clock = ManualClock::shared();
    let origin = clock.now();
    let (root, cancel) = Context::background().with_cancel();

    let ticking = clock.clone();
    let mut task = PeriodicTask::spawn(&root, "clock-driver", Duration::from_secs(1), move || {
        ticking.advance(Duration::from_secs(60));
        async {}
    });

    sleep(Duration::from_millis(5500)).await;
    task.stop().await;
    drop(cancel);

    assert_eq!(clock.elapsed(), Duration::from_secs(300));
    assert_eq!(clock.now() - origin, Duration::from_secs(300));
}
