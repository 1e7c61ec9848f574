//! Cooperative multi-participant activity scheduling.
//!
//! A [`Party`] is a single logical activity hosting up to
//! [`MAX_PARTICIPANTS`] independently-suspendable *participants*: polled
//! computations that run **serially** on their party while different
//! parties run in parallel on a shared worker pool. Wakeups from arbitrary
//! threads re-enter the party and poll only the participants with pending
//! work, using a wake bitmap carried — together with the reference count,
//! the run-lock, and the allocation set — in a single atomic word, so that
//! the operations that race in practice are each decided by one
//! compare-and-swap (see [`sync`]).
//!
//! # Model
//!
//! - A participant is any [`Promise`]: a callable polled to
//!   [`Poll::Ready`], [`Poll::Pending`], or [`Poll::Cancelled`]. Plain
//!   `FnMut() -> Poll<T>` closures qualify.
//! - [`Party::spawn`] reserves the lowest free slot and schedules the first
//!   poll on the injected [`Executor`]; the completion continuation runs
//!   exactly once, on whichever thread observes the ready value.
//! - A poll that returns `Pending` must first mint a [`Waker`] for itself
//!   through the [`context`] of the current activity. Owning wakers keep
//!   the party alive; non-owning wakers become inert once it is orphaned.
//! - [`BulkSpawner`] commits several spawns in one atomic step;
//!   [`Party::spawn_waitable`] bridges a completion into another party.
//!
//! # Example
//!
//! ```
//! use party::{Arena, Party, Poll, ThreadPoolExecutor};
//! use std::sync::{mpsc, Arc};
//!
//! let executor = Arc::new(ThreadPoolExecutor::new(2));
//! let party = Party::make(Arena::new(), executor.clone());
//!
//! let (tx, rx) = mpsc::channel();
//! party
//!     .spawn("answer", || Poll::Ready(42), move |value| {
//!         let _ = tx.send(value);
//!     })
//!     .unwrap();
//! assert_eq!(rx.recv().unwrap(), 42);
//! ```
//!
//! # What this crate is not
//!
//! There is no timer wheel, no combinator library, no I/O reactor, and no
//! fairness policy between parties; those live in the layers that inject
//! the [`Executor`] and fill the [`Arena`]. Cancellation is cooperative: a
//! participant observes a signal of its own and returns
//! [`Poll::Cancelled`].

#![warn(missing_docs)]

pub mod arena;
pub mod context;
pub mod error;
pub mod executor;
mod participant;
pub mod party;
pub mod poll;
pub mod sync;
pub mod waitable;
pub mod waker;

pub use arena::Arena;
pub use error::SpawnError;
pub use executor::{Executor, InlineExecutor, ThreadPoolExecutor};
pub use party::{BulkSpawner, Party};
pub use poll::{Poll, Promise};
pub use sync::{
    PartySync, PartySyncUsingAtomics, PartySyncUsingMutex, WakeupMask, MAX_PARTICIPANTS,
};
pub use waitable::Waitable;
pub use waker::Waker;
