//! Execution context threaded through every store and cache call.
//!
//! A [`Context`] carries a cancellation token and an optional deadline. It has
//! no other semantic role: the service hands it to each collaborator call and
//! races the call against it, so a cancelled or expired caller stops waiting
//! on the backend immediately.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use contatori_store::context::Context;
//!
//! let ctx = Context::new().with_timeout(Duration::from_millis(250));
//! assert!(ctx.remaining().is_some());
//! assert!(!ctx.is_cancelled());
//!
//! ctx.cancel();
//! assert!(ctx.is_cancelled());
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, StoreError};

/// Why a call was cut short by its [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The cancellation token fired.
    Cancelled,
    /// The deadline elapsed; carries the budget the context was given.
    DeadlineExceeded(Duration),
}

impl From<Interrupted> for StoreError {
    fn from(value: Interrupted) -> Self {
        match value {
            Interrupted::Cancelled => StoreError::Cancelled,
            Interrupted::DeadlineExceeded(budget) => StoreError::DeadlineExceeded(budget),
        }
    }
}

impl From<Interrupted> for CacheError {
    fn from(value: Interrupted) -> Self {
        match value {
            Interrupted::Cancelled => CacheError::Cancelled,
            Interrupted::DeadlineExceeded(budget) => CacheError::DeadlineExceeded(budget),
        }
    }
}

/// Caller-supplied cancellation and deadline.
///
/// Cloning a context shares its cancellation token, so cancelling any clone
/// cancels them all.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl Context {
    /// Creates a context with no deadline that is never cancelled unless
    /// [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            deadline: Some((Instant::now() + timeout, timeout)),
            ..self
        }
    }

    /// Sets an absolute deadline.
    pub fn with_deadline(self, deadline: Instant) -> Self {
        let budget = deadline.saturating_duration_since(Instant::now());
        Self {
            deadline: Some((deadline, budget)),
            ..self
        }
    }

    /// Uses an existing cancellation token, typically a child of the
    /// caller's request token.
    pub fn with_cancellation(self, token: CancellationToken) -> Self {
        Self { token, ..self }
    }

    /// Returns the cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels this context and every clone of it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` if the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Time left before the deadline, or `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fails fast if the context is already cancelled or past its deadline.
    ///
    /// Backends that do synchronous work use this in place of [`run`](Self::run).
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some((deadline, budget)) if Instant::now() >= deadline => {
                Err(Interrupted::DeadlineExceeded(budget))
            }
            _ => Ok(()),
        }
    }

    /// Runs `fut` until it completes, the context is cancelled, or the
    /// deadline elapses, whichever comes first.
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Interrupted>,
    {
        self.check()?;

        let guarded = async {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(Interrupted::Cancelled.into()),
                res = fut => res,
            }
        };

        match self.deadline {
            Some((deadline, budget)) => tokio::time::timeout_at(deadline, guarded)
                .await
                .unwrap_or_else(|_| Err(Interrupted::DeadlineExceeded(budget).into())),
            None => guarded.await,
        }
    }
}
