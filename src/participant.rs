//! Type-erased participants and the fixed-size slot table.
//!
//! A participant is erased at spawn time into a single boxed closure that
//! fuses the polling body with its completion continuation: polling it
//! returns `true` exactly when the slot can be retired. The table is a
//! fixed array of cells, one per slot, plus a per-slot generation counter
//! bumped at retirement so that wakers addressed to a previous occupant of
//! a reused slot can recognize themselves as stale.
//!
//! The cells are behind per-slot mutexes purely to keep the crate in safe
//! Rust; the protocol already makes them uncontended. Only the run-lock
//! holder polls, and only the thread that reserved a slot installs into it,
//! strictly before the slot's wake bit becomes visible.

use crate::sync::MAX_PARTICIPANTS;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// A spawned computation occupying one slot.
///
/// `poll` returns `true` when the participant completed (its continuation,
/// if any, has already run) and the slot can be retired.
pub(crate) struct Participant {
    name: &'static str,
    poll: Box<dyn FnMut() -> bool + Send>,
}

impl Participant {
    pub(crate) fn new(name: &'static str, poll: Box<dyn FnMut() -> bool + Send>) -> Self {
        Self { name, poll }
    }

    #[inline]
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub(crate) fn poll(&mut self) -> bool {
        (self.poll)()
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant").field("name", &self.name).finish_non_exhaustive()
    }
}

/// The party's participant storage: one cell and one generation per slot.
pub(crate) struct ParticipantTable {
    slots: [Mutex<Option<Participant>>; MAX_PARTICIPANTS],
    generations: [AtomicU32; MAX_PARTICIPANTS],
}

impl ParticipantTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(None)),
            generations: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Installs a participant into a freshly reserved slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already occupied; reserving the slot through
    /// the state word before installing is the caller's contract.
    pub(crate) fn install(&self, slot: usize, participant: Participant) {
        let previous = self.slots[slot].lock().replace(participant);
        assert!(previous.is_none(), "participant installed into an occupied slot");
    }

    /// Locks a slot cell for polling or retirement.
    pub(crate) fn cell(&self, slot: usize) -> parking_lot::MutexGuard<'_, Option<Participant>> {
        self.slots[slot].lock()
    }

    /// Removes whatever occupies a slot, if anything.
    pub(crate) fn take(&self, slot: usize) -> Option<Participant> {
        self.slots[slot].lock().take()
    }

    /// The slot's current generation.
    #[inline]
    pub(crate) fn generation(&self, slot: usize) -> u32 {
        self.generations[slot].load(Ordering::Acquire)
    }

    /// Advances the slot's generation at retirement, invalidating any waker
    /// still addressed to the previous occupant.
    #[inline]
    pub(crate) fn bump_generation(&self, slot: usize) {
        self.generations[slot].fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ParticipantTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantTable").finish_non_exhaustive()
    }
}
