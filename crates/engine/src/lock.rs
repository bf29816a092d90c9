//! Single-holder execution lock with a force-release watchdog.
//!
//! At most one command executes at a time. A holder that never releases is
//! evicted after `max_hold`, either by the watchdog task or lazily by the
//! next `acquire` when no runtime was available to spawn one.

use crate::error::EngineError;
use crate::metrics;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Default)]
struct LockState {
    held: bool,
    acquired_at: Option<Instant>,
    token: u64,
    watchdog: Option<JoinHandle<()>>,
}

struct LockInner {
    state: Mutex<LockState>,
    max_hold: Duration,
    released: Notify,
}

impl LockInner {
    fn release_locked(&self, state: &mut LockState, abort_watchdog: bool) {
        state.held = false;
        state.acquired_at = None;
        if let Some(watchdog) = state.watchdog.take() {
            if abort_watchdog {
                watchdog.abort();
            }
        }
        self.released.notify_waiters();
    }

    fn force_release_locked(&self, state: &mut LockState, abort_watchdog: bool) {
        let held_for = state
            .acquired_at
            .map(|at| at.elapsed())
            .unwrap_or(self.max_hold);
        warn!("{}", EngineError::LockAbandoned { held_for });
        metrics::increment_lock_force_release();
        self.release_locked(state, abort_watchdog);
    }

    /// Watchdog entry point; only evicts the holder it was armed for.
    fn expire_holder(&self, token: u64) {
        let mut state = self.state.lock();
        if state.held && state.token == token {
            self.force_release_locked(&mut state, false);
        }
    }
}

/// Mutual exclusion for command execution.
#[derive(Clone)]
pub struct ExecutionLock {
    inner: Arc<LockInner>,
}

impl ExecutionLock {
    pub fn new(max_hold: Duration) -> Self {
        Self {
            inner: Arc::new(LockInner {
                state: Mutex::new(LockState::default()),
                max_hold,
                released: Notify::new(),
            }),
        }
    }

    pub fn max_hold(&self) -> Duration {
        self.inner.max_hold
    }

    pub fn is_held(&self) -> bool {
        self.inner.state.lock().held
    }

    /// How long the current holder has held the lock.
    pub fn held_for(&self) -> Option<Duration> {
        self.inner.state.lock().acquired_at.map(|at| at.elapsed())
    }

    /// Non-blocking acquire. Returns `false` if already held.
    pub fn acquire(&self) -> bool {
        self.acquire_token().is_some()
    }

    fn acquire_token(&self) -> Option<u64> {
        let mut state = self.inner.state.lock();

        if state.held {
            let overdue = state
                .acquired_at
                .is_some_and(|at| at.elapsed() >= self.inner.max_hold);
            if !overdue {
                return None;
            }
            self.inner.force_release_locked(&mut state, true);
        }

        state.held = true;
        state.acquired_at = Some(Instant::now());
        state.token = state.token.wrapping_add(1);
        let token = state.token;

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let weak: Weak<LockInner> = Arc::downgrade(&self.inner);
            let max_hold = self.inner.max_hold;
            state.watchdog = Some(runtime.spawn(async move {
                tokio::time::sleep(max_hold).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expire_holder(token);
                }
            }));
        }

        debug!("Execution lock acquired");
        Some(token)
    }

    /// Release the lock. No-op if not held.
    pub fn release(&self) {
        let mut state = self.inner.state.lock();
        if state.held {
            self.inner.release_locked(&mut state, true);
            debug!("Execution lock released");
        }
    }

    /// Acquire and return a guard that releases on drop.
    ///
    /// The guard only releases the hold it was created for; after a
    /// force-release and re-acquire by someone else, dropping it is a no-op.
    pub fn try_lock(&self) -> Option<LockGuard> {
        let token = self.acquire_token()?;
        Some(LockGuard {
            inner: Arc::clone(&self.inner),
            token,
        })
    }

    /// Acquire with `attempts` tries, backing off `base * 2^n` between them
    /// or until the current holder releases, whichever comes first.
    pub async fn acquire_with_retry(
        &self,
        attempts: u32,
        base: Duration,
    ) -> Result<LockGuard, EngineError> {
        let timer = metrics::MetricTimer::new("viewlink_lock_wait_duration");
        let attempts = attempts.max(1);

        for attempt in 0..attempts {
            if let Some(guard) = self.try_lock() {
                drop(timer);
                return Ok(guard);
            }
            if attempt + 1 == attempts {
                break;
            }
            let backoff = base.saturating_mul(2u32.saturating_pow(attempt));
            tokio::select! {
                _ = self.released() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        Err(EngineError::LockBusy { attempts })
    }

    /// Resolves once the lock is not held.
    pub async fn released(&self) {
        let notified = self.inner.released.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_held() {
            return;
        }
        notified.await;
    }
}

/// RAII hold on an [`ExecutionLock`].
pub struct LockGuard {
    inner: Arc<LockInner>,
    token: u64,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.held && state.token == self.token {
            self.inner.release_locked(&mut state, true);
        }
    }
}
