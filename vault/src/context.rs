//! Cancellable, deadline-bound request context.
//!
//! Every backend call and every object store round trip made on behalf of
//! a reconciliation goes through [`RequestContext::run`], so a cancelled
//! reconciliation stops at the next I/O boundary instead of mutating
//! caches with a half-built client.

use crate::error::{VaultError, VaultResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Request-scoped cancellation and deadline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}

impl RequestContext {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            timeout: None,
        }
    }

    /// A context that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().child_with_timeout(timeout)
    }

    /// Derive a child context with a tighter deadline.
    ///
    /// The child is cancelled whenever the parent is; the effective deadline
    /// is the earlier of the two.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let (deadline, timeout) = match self.deadline {
            Some(existing) if existing <= candidate => (existing, self.timeout),
            _ => (candidate, Some(timeout)),
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
            timeout,
        }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the context has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the deadline has already passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Fail fast if the context is already done.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Cancelled`] or [`VaultError::DeadlineExceeded`].
    pub fn check(&self) -> VaultResult<()> {
        if self.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        if self.is_expired() {
            return Err(VaultError::DeadlineExceeded(self.timeout.unwrap_or_default()));
        }
        Ok(())
    }

    /// Run `fut` bounded by this context.
    ///
    /// # Errors
    ///
    /// Returns the future's own error, or [`VaultError::Cancelled`] /
    /// [`VaultError::DeadlineExceeded`] when the context finishes first.
    pub async fn run<T, F>(&self, fut: F) -> VaultResult<T>
    where
        F: Future<Output = VaultResult<T>>,
    {
        self.check()?;
        let timeout = self.timeout.unwrap_or_default();
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.cancel.cancelled() => Err(VaultError::Cancelled),
                () = tokio::time::sleep_until(deadline) => {
                    Err(VaultError::DeadlineExceeded(timeout))
                }
                result = fut => result,
            },
            None => tokio::select! {
                () = self.cancel.cancelled() => Err(VaultError::Cancelled),
                result = fut => result,
            },
        }
    }
}
