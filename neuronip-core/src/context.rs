//! Cooperative cancellation and deadlines.
//!
//! A [`Context`] carries a cancellation token and an optional deadline. Child
//! contexts are cancelled with their parent and never outlive its deadline.
//! Work that accepts a context is expected to observe it, either by polling
//! [`Context::err`] or by racing its future through [`Context::run`].
//!
//! Deadlines are measured on the tokio timer, so paused-time tests apply.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Why a context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation scope with an optional deadline.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A root context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a child that can be cancelled independently of its parent.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let token = self.token.child_token();
        (
            Context {
                token: token.clone(),
                deadline: self.deadline,
            },
            CancelHandle { token },
        )
    }

    /// Derive a child whose deadline is the earlier of the parent's deadline
    /// and `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        let candidate = Instant::now().checked_add(timeout);
        let deadline = match (self.deadline, candidate) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (Some(parent), None) => Some(parent),
            (None, own) => own,
        };

        let token = self.token.child_token();
        (
            Context {
                token: token.clone(),
                deadline,
            },
            CancelHandle { token },
        )
    }

    /// The instant at which this context expires, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Reason the context ended, or `None` while it is still live.
    ///
    /// An elapsed deadline takes precedence over cancellation, since
    /// releasing a [`CancelHandle`] after its deadline also cancels.
    pub fn err(&self) -> Option<ContextError> {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Some(ContextError::DeadlineExceeded);
        }
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        None
    }

    /// Whether the context has ended.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Wait until the context ends.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = sleep_until(deadline) => ContextError::DeadlineExceeded,
                _ = self.token.cancelled() => ContextError::Canceled,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Run `future` until it completes or the context ends, whichever comes
    /// first. The future is dropped in place when the context wins.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        tokio::select! {
            biased;
            output = future => Ok(output),
            err = self.done() => Err(err),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

/// Cancels the context it was created with when dropped or cancelled.
#[derive(Debug)]
#[must_use = "dropping a CancelHandle cancels its context immediately"]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Cancel the associated context now.
    pub fn cancel(self) {
        self.token.cancel();
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
