//! Cancellation / deadline signal threaded through every operation.
//!
//! A [`Context`] is a cheap, cloneable handle to a one-shot "done" event.
//! It finishes when its [`Canceller`] fires, when its deadline passes, or
//! when its parent finishes. Whichever producer gets there first fixes the
//! [`ContextError`] every reader observes; later producers are no-ops.
//!
//! ```text
//! background ──► with_cancel ──► with_timeout ──► ...
//!                   │                 │
//!                Canceller         Canceller
//! ```
//!
//! Cancellation only flows downwards: finishing a child never affects its
//! parent.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::ContextError;

struct Inner {
    token: CancellationToken,
    reason: OnceLock<ContextError>,
    /// Effective deadline: the earliest of this context's and its ancestors'.
    deadline: Option<Instant>,
    parent: Option<Context>,
}

/// Cloneable cancellation / deadline signal.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A root context that is never done.
    pub fn background() -> Self {
        Self::from_parts(CancellationToken::new(), None, None)
    }

    /// Derive a context that can be cancelled independently of `parent`.
    pub fn with_cancel(parent: &Context) -> (Context, Canceller) {
        Self::derive(parent, None)
    }

    /// Derive a context that is done at `deadline` at the latest.
    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, Canceller) {
        Self::derive(parent, Some(deadline))
    }

    /// Derive a context that is done `timeout` from now at the latest.
    pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, Canceller) {
        Self::derive(parent, Some(Instant::now() + timeout))
    }

    fn derive(parent: &Context, deadline: Option<Instant>) -> (Context, Canceller) {
        let deadline = match (parent.inner.deadline, deadline) {
            (Some(p), Some(d)) => Some(p.min(d)),
            (p, d) => p.or(d),
        };
        let child = Self::from_parts(
            parent.inner.token.child_token(),
            deadline,
            Some(parent.clone()),
        );
        let canceller = Canceller {
            ctx: child.clone(),
        };
        (child, canceller)
    }

    fn from_parts(
        token: CancellationToken,
        deadline: Option<Instant>,
        parent: Option<Context>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                token,
                reason: OnceLock::new(),
                deadline,
                parent,
            }),
        }
    }

    /// The effective deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Non-blocking check: why the context is done, or `None` while it is live.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(reason) = self.inner.reason.get() {
            return Some(*reason);
        }
        if let Some(reason) = self.inner.parent.as_ref().and_then(Context::err) {
            return Some(self.finish(reason));
        }
        if self.inner.deadline.is_some_and(|d| d <= Instant::now()) {
            return Some(self.finish(ContextError::DeadlineExceeded));
        }
        if self.inner.token.is_cancelled() {
            return Some(self.finish(ContextError::Cancelled));
        }
        None
    }

    /// `true` once the context is done.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the context is done.
    ///
    /// Any number of readers may await this concurrently. The future does
    /// not poll: it parks on the cancellation token and, if there is one,
    /// the deadline timer.
    pub async fn done(&self) -> ContextError {
        if let Some(reason) = self.err() {
            return reason;
        }
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.inner.token.cancelled() => {}
                    _ = time::sleep_until(deadline) => {
                        self.finish(ContextError::DeadlineExceeded);
                    }
                }
            }
            None => self.inner.token.cancelled().await,
        }
        self.err().unwrap_or(ContextError::Cancelled)
    }

    /// Record `reason` unless another producer already did, then release
    /// every waiter. Returns the reason that won.
    fn finish(&self, reason: ContextError) -> ContextError {
        let winner = *self.inner.reason.get_or_init(|| reason);
        self.inner.token.cancel();
        winner
    }
}

/// The single writer for a derived [`Context`].
///
/// Cancelling is idempotent; only the first producer to finish the context
/// decides its [`ContextError`].
#[derive(Clone, Debug)]
pub struct Canceller {
    ctx: Context,
}

impl Canceller {
    /// Finish the context with [`ContextError::Cancelled`], unless it is already done.
    pub fn cancel(&self) {
        self.ctx.finish(ContextError::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_never_done() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn cancel_is_observed_by_all_readers() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let a = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.done().await }
        });
        let b = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.done().await }
        });

        cancel.cancel();
        cancel.cancel();

        assert_eq!(a.await.unwrap(), ContextError::Cancelled);
        assert_eq!(b.await.unwrap(), ContextError::Cancelled);
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn parent_cancel_reaches_child_only_downwards() {
        let (parent, cancel_parent) = Context::with_cancel(&Context::background());
        let (child, cancel_child) = Context::with_cancel(&parent);

        cancel_child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());

        let (other_child, _c) = Context::with_cancel(&parent);
        cancel_parent.cancel();
        assert_eq!(other_child.done().await, ContextError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires() {
        let (ctx, _cancel) =
            Context::with_timeout(&Context::background(), Duration::from_secs(5));
        assert!(ctx.err().is_none());
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn first_producer_wins() {
        let (ctx, cancel) =
            Context::with_timeout(&Context::background(), Duration::from_secs(1));
        cancel.cancel();
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn child_inherits_earlier_parent_deadline() {
        let (parent, _p) =
            Context::with_timeout(&Context::background(), Duration::from_secs(1));
        let (child, _c) = Context::with_timeout(&parent, Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
        assert_eq!(child.done().await, ContextError::DeadlineExceeded);
    }
}
