//! Thread-local plumbing for the current activity.
//!
//! Before each poll the run loop installs the `(party, slot)` pair being
//! polled into a thread-local; the functions here read it so a participant
//! can mint wakers for itself, request an immediate re-poll, or reach its
//! party without threading a handle through every call. The slot is
//! restored when the poll returns — including on unwind — by an RAII guard,
//! so nested runs of different parties on one stack see the right activity
//! at every depth.
//!
//! Calling any of these functions outside a participant poll is a contract
//! violation and panics.

use crate::party::{Party, PartyInner};
use crate::sync::PartySync;
use crate::waker::Waker;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static CURRENT_ACTIVITY: RefCell<Option<PollScope>> = RefCell::new(None);
}

/// The activity installed for the duration of one poll.
pub(crate) struct PollScope {
    inner: Arc<PartyInner>,
    slot: usize,
}

/// Installs `(inner, slot)` as the current activity; the previous activity
/// is restored when the returned guard drops.
pub(crate) fn enter(inner: Arc<PartyInner>, slot: usize) -> ScopeGuard {
    let previous = CURRENT_ACTIVITY
        .with(|current| current.borrow_mut().replace(PollScope { inner, slot }));
    ScopeGuard { previous }
}

/// Restores the previously installed activity on drop.
pub(crate) struct ScopeGuard {
    previous: Option<PollScope>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CURRENT_ACTIVITY.with(|current| *current.borrow_mut() = self.previous.take());
    }
}

fn with_scope<R>(f: impl FnOnce(&PollScope) -> R) -> R {
    CURRENT_ACTIVITY.with(|current| {
        let borrowed = current.borrow();
        let scope = borrowed
            .as_ref()
            .expect("no current activity: called outside a participant poll");
        f(scope)
    })
}

/// Creates a waker for the participant currently being polled that keeps
/// its party alive until the waker fires or is dropped.
///
/// # Panics
///
/// Panics outside a participant poll.
#[must_use]
pub fn make_owning_waker() -> Waker {
    with_scope(|scope| {
        scope.inner.sync.incr_ref_count();
        Waker::owning(
            Party::from_reffed(Arc::clone(&scope.inner)),
            scope.slot,
            scope.inner.participants.generation(scope.slot),
        )
    })
}

/// Creates a waker for the participant currently being polled that does
/// *not* keep its party alive: firing it after the party is orphaned is a
/// silent no-op that tombstones the waker.
///
/// # Panics
///
/// Panics outside a participant poll.
#[must_use]
pub fn make_non_owning_waker() -> Waker {
    with_scope(|scope| {
        Waker::non_owning(
            Arc::downgrade(&scope.inner),
            scope.slot,
            scope.inner.participants.generation(scope.slot),
        )
    })
}

/// Marks the participant currently being polled for a re-poll in the run
/// loop's next pass, without needing a waker.
///
/// # Panics
///
/// Panics outside a participant poll.
pub fn force_immediate_repoll() {
    with_scope(|scope| {
        scope.inner.sync.force_immediate_repoll(1 << scope.slot);
    });
}

/// A strong handle to the party currently being polled; useful for spawning
/// siblings from inside a participant.
///
/// # Panics
///
/// Panics outside a participant poll.
#[must_use]
pub fn current() -> Party {
    with_scope(|scope| {
        scope.inner.sync.incr_ref_count();
        Party::from_reffed(Arc::clone(&scope.inner))
    })
}
