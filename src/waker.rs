//! Wakeup handles for suspended participants.
//!
//! A [`Waker`] schedules a re-poll of one participant in one party. Wakers
//! are one-shot: `wakeup` consumes the handle, and a participant that
//! suspends again mints a fresh waker on its next poll. Two flavors exist —
//! owning (keeps the party alive) and non-owning (inert after the party is
//! orphaned) — plus the default unwakeable state a moved-from or
//! never-armed waker sits in.
//!
//! Wakers may be created only from inside a poll (see
//! [`crate::context::make_owning_waker`]), but may be moved to, fired from,
//! and dropped on any thread. Dropping a non-owning waker after its party
//! is gone touches nothing but reference counts.

use crate::party::{Party, PartyInner};
use std::fmt;
use std::mem;
use std::sync::Weak;
use tracing::trace;

enum WakerInner {
    Unwakeable,
    Owning {
        party: Party,
        slot: usize,
        generation: u32,
    },
    NonOwning {
        party: Weak<PartyInner>,
        slot: usize,
        generation: u32,
    },
}

/// A one-shot handle that schedules a re-poll of a specific participant.
pub struct Waker {
    inner: WakerInner,
}

impl Waker {
    /// A waker that does nothing when fired; the state every waker reaches
    /// after its first `wakeup`.
    #[must_use]
    pub fn unwakeable() -> Self {
        Self {
            inner: WakerInner::Unwakeable,
        }
    }

    pub(crate) fn owning(party: Party, slot: usize, generation: u32) -> Self {
        Self {
            inner: WakerInner::Owning {
                party,
                slot,
                generation,
            },
        }
    }

    pub(crate) fn non_owning(party: Weak<PartyInner>, slot: usize, generation: u32) -> Self {
        Self {
            inner: WakerInner::NonOwning {
                party,
                slot,
                generation,
            },
        }
    }

    /// Whether firing this waker can still have any effect.
    ///
    /// `true` after the waker fired once, was created unwakeable, or — for
    /// the non-owning flavor — attempted a wakeup after its party was
    /// orphaned. Orphaning alone does not flip this: it is the first
    /// (no-op) `wakeup` that observes it.
    #[must_use]
    pub fn is_unwakeable(&self) -> bool {
        matches!(self.inner, WakerInner::Unwakeable)
    }

    /// Schedules the participant for a re-poll, running the party on this
    /// thread if the wake acquired the run-lock. Consumes the charge: the
    /// waker is unwakeable afterwards.
    ///
    /// Firing a non-owning waker whose party is gone — or either flavor
    /// addressed to a slot since reused — is a silent no-op.
    pub fn wakeup(&mut self) {
        match mem::replace(&mut self.inner, WakerInner::Unwakeable) {
            WakerInner::Unwakeable => {}
            WakerInner::Owning {
                party,
                slot,
                generation,
            } => party.wakeup_slot(slot, generation),
            WakerInner::NonOwning {
                party,
                slot,
                generation,
            } => match Party::try_upgrade(&party) {
                Some(party) => party.wakeup_slot(slot, generation),
                None => trace!(slot, "wakeup of an orphaned party ignored"),
            },
        }
    }

    /// Like [`wakeup`](Self::wakeup), but posts the wake to the party's
    /// executor instead of running it on this thread. Required when the
    /// caller holds a lock the woken participant might take.
    pub fn wakeup_async(&mut self) {
        match mem::replace(&mut self.inner, WakerInner::Unwakeable) {
            WakerInner::Unwakeable => {}
            WakerInner::Owning {
                party,
                slot,
                generation,
            } => party.wakeup_slot_async(slot, generation),
            WakerInner::NonOwning {
                party,
                slot,
                generation,
            } => match Party::try_upgrade(&party) {
                Some(party) => party.wakeup_slot_async(slot, generation),
                None => trace!(slot, "async wakeup of an orphaned party ignored"),
            },
        }
    }
}

impl Default for Waker {
    fn default() -> Self {
        Self::unwakeable()
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner {
            WakerInner::Unwakeable => "unwakeable",
            WakerInner::Owning { .. } => "owning",
            WakerInner::NonOwning { .. } => "non-owning",
        };
        f.debug_struct("Waker").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unwakeable() {
        let mut waker = Waker::default();
        assert!(waker.is_unwakeable());
        // Firing an unwakeable waker is a no-op, not an error.
        waker.wakeup();
        waker.wakeup_async();
        assert!(waker.is_unwakeable());
    }
}
