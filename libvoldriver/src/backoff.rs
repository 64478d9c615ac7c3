//! # Exponential backoff retry controller.
//!
//! [`ExponentialBackoff::retry`] keeps invoking an operation until it
//! succeeds, the loop's own elapsed-time budget runs out, or the carried
//! [`Context`](crate::context::Context) is done.
//!
//! ```text
//! start = clock.now()
//! loop {
//!   ├─► attempt += 1; op(env)
//!   │       ├─ Ok  ──► return Ok
//!   │       └─ Err ──► ctx done?            ─► Cancelled
//!   │                  elapsed >= budget?   ─► Exhausted(last error)
//!   │                  sleep(policy.next)   (preempted by ctx ─► Cancelled)
//! }
//! ```
//!
//! The budget is measured from the loop's own start and is independent of
//! any deadline on the context: a loop without a context is still bounded.
//! This controller is the single retry authority; callers never wrap it in
//! a retry loop of their own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::env::DriverEnv;
use crate::error::RetryError;

/// Default intrinsic elapsed-time budget.
pub const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(30);

/// Shape of the wait schedule between failed attempts.
///
/// The wait after failed attempt `n` (0-indexed) is
/// `initial_interval × multiplier^n`, clamped to `max_interval`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Wait after the first failure.
    pub initial_interval: Duration,
    /// Growth factor applied after each failure (`>= 1.0`).
    pub multiplier: f64,
    /// Cap on any single wait.
    pub max_interval: Duration,
    /// Intrinsic elapsed-time budget for the whole loop.
    pub max_elapsed: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(10),
            max_elapsed: DEFAULT_MAX_ELAPSED,
        }
    }
}

impl BackoffPolicy {
    /// Wait to apply after failed attempt number `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Retry loop bounded by an elapsed-time budget and a context.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    env: DriverEnv,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
}

impl ExponentialBackoff {
    /// `env` of `None` means no cancellation; the budget still applies.
    pub fn new(env: Option<DriverEnv>, clock: Arc<dyn Clock>) -> Self {
        Self {
            env: env.unwrap_or_default(),
            clock,
            policy: BackoffPolicy::default(),
        }
    }

    /// Default schedule with a custom budget.
    pub fn with_budget(env: Option<DriverEnv>, max_elapsed: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::new(env, clock).with_policy(BackoffPolicy {
            max_elapsed,
            ..BackoffPolicy::default()
        })
    }

    /// Wall-clock controller with the default policy.
    pub fn system(env: Option<DriverEnv>) -> Self {
        Self::new(env, Arc::new(SystemClock))
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, the budget is spent, or the context is done.
    ///
    /// At least one attempt is always made. Cancellation noticed right
    /// after an attempt wins over that attempt's error, so an operation
    /// that cancels its own context stops the loop on the same iteration.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(DriverEnv) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let env = self.env.session("retry");
        let ctx = env.context();
        let start = self.clock.now();
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            let err = match op(self.env.clone()).await {
                Ok(value) => {
                    debug!(parent: env.span(), attempts, "operation succeeded");
                    return Ok(value);
                }
                Err(err) => err,
            };

            if let Some(reason) = ctx.err() {
                debug!(parent: env.span(), attempts, error = %err, %reason, "operation failed after cancellation");
                return Err(RetryError::Cancelled(reason));
            }

            let elapsed = self.clock.since(start);
            if elapsed >= self.policy.max_elapsed {
                warn!(parent: env.span(), attempts, ?elapsed, error = %err, "retry budget exhausted");
                return Err(RetryError::Exhausted {
                    attempts,
                    last: err,
                });
            }

            let delay = self.policy.next(attempts - 1);
            debug!(parent: env.span(), attempts, ?delay, error = %err, "operation failed, backing off");

            tokio::select! {
                biased;
                reason = ctx.done() => {
                    debug!(parent: env.span(), attempts, %reason, "backoff interrupted");
                    return Err(RetryError::Cancelled(reason));
                }
                _ = self.clock.sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::task::JoinHandle;
    use tracing::Span;

    use super::*;
    use crate::clock::FakeClock;
    use crate::context::Context;
    use crate::error::ContextError;

    fn env(ctx: Context) -> DriverEnv {
        DriverEnv::new(Span::none(), ctx)
    }

    fn always_failing(
        backoff: ExponentialBackoff,
        count: Arc<AtomicU32>,
    ) -> JoinHandle<Result<(), RetryError<String>>> {
        tokio::spawn(async move {
            backoff
                .retry(|_env| {
                    count.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("badness".to_owned()) }
                })
                .await
        })
    }

    #[test]
    fn policy_grows_and_caps() {
        let policy = BackoffPolicy {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(1),
            max_elapsed: DEFAULT_MAX_ELAPSED,
        };
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(3), Duration::from_millis(800));
        assert_eq!(policy.next(4), Duration::from_secs(1));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let clock = Arc::new(FakeClock::default());
        let backoff = ExponentialBackoff::new(Some(env(Context::background())), clock.clone());
        let count = AtomicU32::new(0);

        let res = backoff
            .retry(|_env| {
                count.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(42) }
            })
            .await;

        assert_eq!(res.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(clock.watcher_count(), 0);
    }

    #[tokio::test]
    async fn exhausts_once_budget_passes() {
        let clock = Arc::new(FakeClock::default());
        let backoff = ExponentialBackoff::new(None, clock.clone());
        let count = Arc::new(AtomicU32::new(0));

        let handle = always_failing(backoff, count.clone());
        clock
            .wait_for_watcher_and_increment(Duration::from_secs(31))
            .await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.to_string(), "badness");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_until_budget_with_deadline_context() {
        let clock = Arc::new(FakeClock::default());
        let (ctx, _cancel) =
            Context::with_timeout(&Context::background(), Duration::from_secs(30));
        let backoff = ExponentialBackoff::new(Some(env(ctx)), clock.clone());
        let count = Arc::new(AtomicU32::new(0));

        let handle = always_failing(backoff, count.clone());
        clock
            .wait_for_watcher_and_increment(Duration::from_secs(15))
            .await;
        clock
            .wait_for_watcher_and_increment(Duration::from_secs(20))
            .await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_context_is_still_bounded() {
        let clock = Arc::new(FakeClock::default());
        let backoff = ExponentialBackoff::new(None, clock.clone());
        let count = Arc::new(AtomicU32::new(0));

        let handle = always_failing(backoff, count.clone());
        clock
            .wait_for_watcher_and_increment(Duration::from_secs(15))
            .await;
        clock
            .wait_for_watcher_and_increment(Duration::from_secs(20))
            .await;

        assert!(handle.await.unwrap().unwrap_err().is_exhausted());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempt_count_follows_schedule() {
        let clock = Arc::new(FakeClock::default());
        let policy = BackoffPolicy {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(8),
            max_elapsed: Duration::from_secs(30),
        };
        let backoff = ExponentialBackoff::new(None, clock.clone()).with_policy(policy);
        let count = Arc::new(AtomicU32::new(0));

        let handle = always_failing(backoff, count.clone());
        // Waits: 1, 2, 4, 8, 8, 8 -> attempt 7 starts at t=31 and gives up.
        for attempt in 0..6 {
            clock
                .wait_for_watcher_and_increment(policy.next(attempt))
                .await;
        }

        assert!(handle.await.unwrap().unwrap_err().is_exhausted());
        assert_eq!(count.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn operation_cancelling_context_stops_loop() {
        let clock = Arc::new(FakeClock::default());
        let (ctx, cancel) = Context::with_timeout(&Context::background(), Duration::from_secs(30));
        let backoff = ExponentialBackoff::new(Some(env(ctx)), clock.clone());
        let mut count = 0;

        let err = backoff
            .retry(|_env| {
                count += 1;
                cancel.cancel();
                async { Err::<(), _>("badness".to_owned()) }
            })
            .await
            .unwrap_err();

        assert_eq!(count, 1);
        assert!(matches!(err, RetryError::Cancelled(ContextError::Cancelled)));
        assert_eq!(clock.watcher_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let clock = Arc::new(FakeClock::default());
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let backoff = ExponentialBackoff::new(Some(env(ctx)), clock.clone());
        let count = Arc::new(AtomicU32::new(0));

        let handle = always_failing(backoff, count.clone());
        clock.wait_for_watcher().await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RetryError::Cancelled(ContextError::Cancelled)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fails_once_then_succeeds() {
        let clock = Arc::new(FakeClock::default());
        let (ctx, _cancel) =
            Context::with_timeout(&Context::background(), Duration::from_secs(30));
        let backoff = ExponentialBackoff::new(Some(env(ctx)), clock.clone());
        let count = Arc::new(AtomicU32::new(0));

        let handle = tokio::spawn({
            let count = count.clone();
            async move {
                backoff
                    .retry(|_env| {
                        let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                        async move {
                            if n == 1 {
                                Err("badness".to_owned())
                            } else {
                                Ok(())
                            }
                        }
                    })
                    .await
            }
        });
        clock
            .wait_for_watcher_and_increment(Duration::from_secs(15))
            .await;

        handle.await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_passing_mid_wait_is_reported() {
        let policy = BackoffPolicy {
            initial_interval: Duration::from_secs(10),
            ..BackoffPolicy::default()
        };
        let (ctx, _cancel) = Context::with_timeout(&Context::background(), Duration::from_secs(1));
        let backoff = ExponentialBackoff::system(Some(env(ctx))).with_policy(policy);

        let err = backoff
            .retry(|_env| async { Err::<(), _>("badness".to_owned()) })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RetryError::Cancelled(ContextError::DeadlineExceeded)
        ));
    }
}
