//! Injectable time source.
//!
//! Everything that measures elapsed time or schedules a wait takes a
//! `Arc<dyn Clock>` instead of reaching for a global. Production wiring uses
//! [`SystemClock`]; tests drive a [`FakeClock`] by hand.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

/// Source of "now" and of waits.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;

    /// Suspend for `duration`. Dropping the future abandons the wait.
    async fn sleep(&self, duration: Duration);

    fn since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Wall clock backed by `tokio::time`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct Sleeper {
    deadline: Instant,
    wake: oneshot::Sender<()>,
}

struct FakeState {
    now: Instant,
    sleepers: Vec<Sleeper>,
}

/// Manually advanced clock.
///
/// Time only moves when [`FakeClock::increment`] is called. A pending
/// [`Clock::sleep`] counts as a watcher until it is woken or dropped.
pub struct FakeClock {
    state: Mutex<FakeState>,
    watcher_added: Notify,
}

impl fmt::Debug for FakeClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("FakeClock")
            .field("now", &state.now)
            .field("sleepers", &state.sleepers.len())
            .finish()
    }
}

impl FakeClock {
    pub fn new(now: Instant) -> Self {
        Self {
            state: Mutex::new(FakeState {
                now,
                sleepers: Vec::new(),
            }),
            watcher_added: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance time by `duration`, waking every sleeper whose deadline passed.
    pub fn increment(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += duration;
        let now = state.now;
        let (due, pending): (Vec<_>, Vec<_>) = state
            .sleepers
            .drain(..)
            .filter(|s| !s.wake.is_closed())
            .partition(|s| s.deadline <= now);
        state.sleepers = pending;
        drop(state);

        for sleeper in due {
            let _ = sleeper.wake.send(());
        }
    }

    /// Number of sleeps currently pending.
    pub fn watcher_count(&self) -> usize {
        self.lock()
            .sleepers
            .iter()
            .filter(|s| !s.wake.is_closed())
            .count()
    }

    /// Wait until at least one sleep is pending.
    pub async fn wait_for_watcher(&self) {
        loop {
            let added = self.watcher_added.notified();
            if self.watcher_count() > 0 {
                return;
            }
            added.await;
        }
    }

    /// Wait for a pending sleep, then advance time by `duration`.
    pub async fn wait_for_watcher_and_increment(&self, duration: Duration) {
        self.wait_for_watcher().await;
        self.increment(duration);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let (wake, woken) = oneshot::channel();
        {
            let mut state = self.lock();
            let deadline = state.now + duration;
            state.sleepers.push(Sleeper { deadline, wake });
        }
        self.watcher_added.notify_waiters();
        let _ = woken.await;
    }
}
