//! Cross-party completion cells.
//!
//! [`Party::spawn_waitable`](crate::party::Party::spawn_waitable) returns a
//! [`Waitable`]: a one-value cell the spawned participant fills on
//! completion, pollable as a promise from a *different* party. The consumer
//! side registers an owning waker for whichever activity polls it, so the
//! completing thread can wake the waiting party directly.
//!
//! The producer half is a completer held inside the spawned participant's
//! continuation. If the participant retires without producing a value —
//! it observed a cancellation signal and returned
//! [`Poll::Cancelled`](crate::poll::Poll::Cancelled), or it was discarded
//! because its party became unreachable while parked — the completer's
//! drop marks the cell abandoned and the consumer observes `Cancelled`
//! instead of waiting forever.

use crate::context;
use crate::poll::Poll;
use crate::waker::Waker;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

struct CellState<T> {
    value: Option<T>,
    completed: bool,
    abandoned: bool,
    waiter: Option<Waker>,
}

struct Cell<T> {
    state: Mutex<CellState<T>>,
}

/// Creates a linked completer/waitable pair around one empty cell.
pub(crate) fn completion_pair<T>() -> (Completer<T>, Waitable<T>) {
    let cell = Arc::new(Cell {
        state: Mutex::new(CellState {
            value: None,
            completed: false,
            abandoned: false,
            waiter: None,
        }),
    });
    (
        Completer {
            cell: Arc::clone(&cell),
        },
        Waitable { cell },
    )
}

/// Producer half: fills the cell exactly once, or marks it abandoned when
/// dropped unfired.
pub(crate) struct Completer<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, value: T) {
        let waiter = {
            let mut state = self.cell.state.lock();
            state.value = Some(value);
            state.completed = true;
            state.waiter.take()
        };
        // Wake outside the cell lock: the wake may run the waiting party on
        // this stack, and that party may immediately re-poll the cell.
        if let Some(mut waker) = waiter {
            waker.wakeup();
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        let waiter = {
            let mut state = self.cell.state.lock();
            if state.completed {
                return;
            }
            state.abandoned = true;
            state.waiter.take()
        };
        if let Some(mut waker) = waiter {
            waker.wakeup();
        }
    }
}

/// A completion produced by one party, awaitable from another.
pub struct Waitable<T> {
    cell: Arc<Cell<T>>,
}

impl<T: Send + 'static> Waitable<T> {
    /// Turns the waitable into a promise: `Pending` until the producing
    /// participant completes (registering a waker for the polling activity
    /// each time), `Ready` with its value once it has, `Cancelled` if the
    /// producer retired without ever producing one.
    ///
    /// Must be polled from inside a participant of some party.
    #[must_use]
    pub fn wait(self) -> impl FnMut() -> Poll<T> + Send + 'static {
        let cell = self.cell;
        move || {
            let mut state = cell.state.lock();
            if let Some(value) = state.value.take() {
                return Poll::Ready(value);
            }
            if state.abandoned {
                return Poll::Cancelled;
            }
            state.waiter = Some(context::make_owning_waker());
            Poll::Pending
        }
    }
}

impl<T> fmt::Debug for Waitable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.cell.state.lock();
        f.debug_struct("Waitable")
            .field("completed", &state.completed)
            .field("abandoned", &state.abandoned)
            .finish()
    }
}
