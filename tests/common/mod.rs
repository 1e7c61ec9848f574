//! Shared helpers for the end-to-end suites.

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use party::{context, Poll, Waker};
use std::sync::Arc;
use std::sync::Once;

/// Installs a tracing subscriber once per test binary; verbosity comes from
/// `RUST_LOG`.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A one-shot cross-thread notification (mutex + condvar).
#[derive(Default)]
pub struct Notification {
    fired: Mutex<bool>,
    cvar: Condvar,
}

impl Notification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        self.cvar.notify_all();
    }

    pub fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.cvar.wait(&mut fired);
        }
    }

    pub fn has_been_notified(&self) -> bool {
        *self.fired.lock()
    }
}

struct PromiseNotificationState {
    done: bool,
    waker: Option<Waker>,
}

/// A notifier whose wait side is a promise: `Pending` (arming a waker for
/// the polling activity) until `notify` is called, then `Ready(42)`.
pub struct PromiseNotification {
    owning_waker: bool,
    state: Mutex<PromiseNotificationState>,
}

impl PromiseNotification {
    pub fn new(owning_waker: bool) -> Arc<Self> {
        Arc::new(Self {
            owning_waker,
            state: Mutex::new(PromiseNotificationState {
                done: false,
                waker: None,
            }),
        })
    }

    /// The promise side; spawn this onto a party.
    pub fn wait(self: &Arc<Self>) -> impl FnMut() -> Poll<i32> + Send + 'static {
        let this = Arc::clone(self);
        move || {
            let mut state = this.state.lock();
            if state.done {
                return Poll::Ready(42);
            }
            state.waker = Some(if this.owning_waker {
                context::make_owning_waker()
            } else {
                context::make_non_owning_waker()
            });
            Poll::Pending
        }
    }

    /// Completes the wait and fires the armed waker, if any, outside the
    /// notifier's own lock.
    pub fn notify(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.done = true;
            state.waker.take()
        };
        if let Some(mut waker) = waker {
            waker.wakeup();
        }
    }

    /// Completes the wait while *holding* the notifier's lock; the wake is
    /// deferred to the executor, which is the point of `wakeup_async`.
    pub fn notify_under_lock(&self) {
        let mut state = self.state.lock();
        state.done = true;
        if let Some(mut waker) = state.waker.take() {
            waker.wakeup_async();
        }
    }
}

/// Deterministic xorshift PRNG for randomized schedules; no external crate,
/// same sequence for the same seed.
pub struct StressRng {
    state: u64,
}

impl StressRng {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform-ish draw in `[0, bound)`; bias is irrelevant for schedule
    /// shuffling.
    pub fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }

    /// True with probability `num / denom`.
    pub fn chance(&mut self, num: u64, denom: u64) -> bool {
        self.next_u64() % denom < num
    }
}
