//! The party state word and its transition protocol.
//!
//! A party's entire hot-path state lives in one 64-bit word so that the
//! operations that race in practice — waking a participant, dropping the
//! last strong ref, reserving a slot, taking the run-lock — are each decided
//! by a single compare-and-swap. Split across several atomics the same
//! protocol would need a fence dance and would still misbehave across
//! orphaning; fused, one CAS answers "did I take the lock, did I cause
//! teardown, is there still work".
//!
//! The word packs five logical fields:
//!
//! - `refs`: strong reference count. The party is torn down at most once,
//!   when this and the allocation bitmap have both reached zero.
//! - `locked`: the run-lock. Set ⇔ some thread is inside [`PartySync::run_party`];
//!   this is what serializes all participant polls of one party.
//! - `allocated`: one bit per slot, set ⇔ the slot holds a live participant.
//! - `wakeups`: one bit per slot, set ⇔ the slot must be polled next pass.
//! - `add_queued`: one bit per slot, set ⇔ a freshly added participant
//!   awaits its first poll.
//!
//! Invariants at every quiescent CAS boundary: `wakeups ⊆ allocated` and
//! `add_queued ⊆ allocated`. Teardown is claimed at most once, and only
//! when the reference count *and* the allocation bitmap are both zero —
//! by an unref that observes the lock free, or by the run loop's own
//! lock-release CAS once its last slot retires. A slot that never retires
//! therefore pins its party: dropping the last reference orphans it but
//! never tears it down.
//!
//! Two interchangeable implementations are provided: the lock-free
//! [`PartySyncUsingAtomics`] used in production, and
//! [`PartySyncUsingMutex`], which mirrors the same five fields under a
//! single mutex and exists to cross-check the protocol on platforms or
//! sanitizer builds where the packed word is inconvenient. Both pass the
//! identical property suite.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of participants a single party can host.
pub const MAX_PARTICIPANTS: usize = 16;

/// One bit per participant slot.
pub type WakeupMask = u16;

// Field layout of the packed word. Private: the five-field semantics are
// the contract, the exact bit positions are not.
const REFS_SHIFT: u32 = 56;
const ONE_REF: u64 = 1 << REFS_SHIFT;
const REFS_MASK: u64 = 0xFF << REFS_SHIFT;
const MAX_REFS: u64 = 0xFF;
const LOCKED_BIT: u64 = 1 << 55;
const ALLOCATED_SHIFT: u32 = 32;
const ALLOCATED_MASK: u64 = 0xFFFF << ALLOCATED_SHIFT;
const WAKEUPS_SHIFT: u32 = 16;
const WAKEUPS_MASK: u64 = 0xFFFF << WAKEUPS_SHIFT;
const QUEUED_MASK: u64 = 0xFFFF;

#[inline]
const fn refs(state: u64) -> u64 {
    (state & REFS_MASK) >> REFS_SHIFT
}

#[inline]
const fn allocated(state: u64) -> WakeupMask {
    ((state & ALLOCATED_MASK) >> ALLOCATED_SHIFT) as WakeupMask
}

#[inline]
const fn wakeups(state: u64) -> WakeupMask {
    ((state & WAKEUPS_MASK) >> WAKEUPS_SHIFT) as WakeupMask
}

#[inline]
const fn queued(state: u64) -> WakeupMask {
    (state & QUEUED_MASK) as WakeupMask
}

#[inline]
const fn pack_allocated(mask: WakeupMask) -> u64 {
    (mask as u64) << ALLOCATED_SHIFT
}

#[inline]
const fn pack_wakeups(mask: WakeupMask) -> u64 {
    (mask as u64) << WAKEUPS_SHIFT
}

#[inline]
const fn pack_queued(mask: WakeupMask) -> u64 {
    mask as u64
}

/// Wake/queue field invariants; checked at CAS success points in debug.
#[inline]
fn debug_check(state: u64) {
    debug_assert_eq!(
        wakeups(state) & !allocated(state),
        0,
        "wakeup bit set for an unallocated slot"
    );
    debug_assert_eq!(
        queued(state) & !allocated(state),
        0,
        "add-queued bit set for an unallocated slot"
    );
}

/// The state-word transition protocol.
///
/// All operations may be called from any thread. `run_party` additionally
/// requires that the caller holds the run-lock, which it obtained from a
/// `true` return of [`add_participants_and_ref`](Self::add_participants_and_ref)
/// or [`schedule_wakeup`](Self::schedule_wakeup).
pub trait PartySync: Send + Sync + Sized + 'static {
    /// Creates the word with `initial_refs` strong references outstanding.
    fn new(initial_refs: usize) -> Self;

    /// Takes an additional strong reference.
    ///
    /// # Panics
    ///
    /// Panics if the reference count would overflow its field.
    fn incr_ref_count(&self);

    /// Takes a strong reference only if at least one is still outstanding.
    ///
    /// Returns `false` exactly when the party is orphaned; used by
    /// non-owning wakers to enter the party safely.
    fn ref_if_non_zero(&self) -> bool;

    /// Drops a strong reference.
    ///
    /// Returns `true` iff this call observed the count reach zero with the
    /// run-lock free *and* the allocation bitmap empty — the caller must
    /// then perform teardown. When the count reaches zero while a run loop
    /// holds the lock, or while slots are still allocated, teardown is
    /// deferred: the run loop's lock-release CAS claims it once the last
    /// slot retires, so at most one claimant exists. A party whose count is
    /// zero but whose participants never complete is never torn down; its
    /// allocated slots pin it.
    fn unref(&self) -> bool;

    /// Reserves `count` free slots (lowest indices first, ascending) and
    /// takes one strong reference, in a single CAS.
    ///
    /// On success, `assign` is called with the reserved indices *before*
    /// their wake bits become visible to any run loop, so a drained wake bit
    /// always finds its participant installed. Returns `Some(true)` iff this
    /// call also acquired the run-lock (the caller must then arrange for the
    /// party to run), `Some(false)` if another thread already held it, and
    /// `None` — with no state change and no reference taken — if fewer than
    /// `count` slots are free.
    fn add_participants_and_ref<F>(&self, count: usize, assign: F) -> Option<bool>
    where
        F: FnOnce(&[usize]);

    /// Sets the wake bits in `mask` for the slots that are still allocated.
    ///
    /// Returns `true` iff this call acquired the run-lock, in which case the
    /// caller must drive [`run_party`](Self::run_party). Wakes for slots no
    /// longer allocated are dropped; if nothing remains to wake, the lock is
    /// not taken.
    fn schedule_wakeup(&self, mask: WakeupMask) -> bool;

    /// Unconditionally sets wake bits from inside a poll, so that the
    /// current `run_party` call re-polls those slots on its next pass.
    ///
    /// Caller must hold the run-lock.
    fn force_immediate_repoll(&self, mask: WakeupMask);

    /// Runs the party until the wake set stays empty, then releases the
    /// run-lock.
    ///
    /// `poll_one(slot)` polls a single participant and returns `true` iff it
    /// completed; completed slots are deallocated at the end of the pass
    /// that completed them, so slot pressure stays bounded even when
    /// wakeups keep extending the tenure. Each pass drains
    /// `wakeups ∪ add_queued` and polls in ascending slot order; bits set
    /// concurrently for a slot above the one being polled join the current
    /// pass, all others wait for the next. The caller must hold the
    /// run-lock.
    ///
    /// Returns `true` iff the CAS that released the lock observed a zero
    /// reference count *and* an empty allocation bitmap — the caller must
    /// then perform teardown. This is how a party that was orphaned while
    /// running is torn down by whichever tenure retires its last slot.
    fn run_party<F>(&self, poll_one: F) -> bool
    where
        F: FnMut(usize) -> bool;
}

/// Lock-free implementation: all five fields in one `AtomicU64`.
#[derive(Debug)]
pub struct PartySyncUsingAtomics {
    state: AtomicU64,
}

impl PartySyncUsingAtomics {
    /// Current allocation bitmap. Test/diagnostic aid; racy by nature.
    #[must_use]
    pub fn allocated_mask(&self) -> WakeupMask {
        allocated(self.state.load(Ordering::Acquire))
    }
}

impl PartySync for PartySyncUsingAtomics {
    fn new(initial_refs: usize) -> Self {
        assert!(initial_refs as u64 <= MAX_REFS, "initial ref count too large");
        Self {
            state: AtomicU64::new((initial_refs as u64) << REFS_SHIFT),
        }
    }

    fn incr_ref_count(&self) {
        let prev = self.state.fetch_add(ONE_REF, Ordering::Relaxed);
        assert!(refs(prev) < MAX_REFS, "party reference count overflow");
    }

    fn ref_if_non_zero(&self) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if refs(state) == 0 {
                return false;
            }
            assert!(refs(state) < MAX_REFS, "party reference count overflow");
            match self.state.compare_exchange_weak(
                state,
                state + ONE_REF,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    fn unref(&self) -> bool {
        let prev = self.state.fetch_sub(ONE_REF, Ordering::AcqRel);
        debug_assert!(refs(prev) > 0, "unref of a dead party");
        refs(prev) == 1 && prev & LOCKED_BIT == 0 && allocated(prev) == 0
    }

    fn add_participants_and_ref<F>(&self, count: usize, assign: F) -> Option<bool>
    where
        F: FnOnce(&[usize]),
    {
        debug_assert!(count >= 1 && count <= MAX_PARTICIPANTS);
        let mut slots = [0usize; MAX_PARTICIPANTS];
        let mask;
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            debug_assert!(refs(state) > 0, "spawn on an orphaned party");
            assert!(refs(state) < MAX_REFS, "party reference count overflow");
            let taken = allocated(state);
            let mut reserve: WakeupMask = 0;
            let mut found = 0;
            for bit in 0..MAX_PARTICIPANTS {
                if found == count {
                    break;
                }
                if taken & (1 << bit) == 0 {
                    slots[found] = bit;
                    reserve |= 1 << bit;
                    found += 1;
                }
            }
            if found < count {
                return None;
            }
            let next = (state + ONE_REF) | pack_allocated(reserve);
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    debug_check(next);
                    mask = reserve;
                    break;
                }
                Err(actual) => state = actual,
            }
        }
        assign(&slots[..count]);
        // Publication point: the wake bits (and the lock, if it was free)
        // become visible only after the participants are installed.
        let prev = self.state.fetch_or(
            pack_wakeups(mask) | pack_queued(mask) | LOCKED_BIT,
            Ordering::AcqRel,
        );
        Some(prev & LOCKED_BIT == 0)
    }

    fn schedule_wakeup(&self, mask: WakeupMask) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            let wake = mask & allocated(state);
            if wake == 0 {
                // Nothing left to wake; do not take the lock.
                return false;
            }
            let next = state | pack_wakeups(wake) | LOCKED_BIT;
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    debug_check(next);
                    return state & LOCKED_BIT == 0;
                }
                Err(actual) => state = actual,
            }
        }
    }

    fn force_immediate_repoll(&self, mask: WakeupMask) {
        let prev = self.state.fetch_or(pack_wakeups(mask), Ordering::AcqRel);
        debug_assert!(prev & LOCKED_BIT != 0, "repoll outside the run loop");
    }

    fn run_party<F>(&self, mut poll_one: F) -> bool
    where
        F: FnMut(usize) -> bool,
    {
        // Bits drained mid-pass that must wait for the next pass.
        let mut carry: WakeupMask = 0;
        loop {
            let prev = self
                .state
                .fetch_and(!(WAKEUPS_MASK | QUEUED_MASK), Ordering::AcqRel);
            debug_assert!(prev & LOCKED_BIT != 0, "run loop without the run-lock");
            let mut pass = carry | wakeups(prev) | queued(prev);
            carry = 0;
            let mut keep: WakeupMask = WakeupMask::MAX;
            while pass != 0 {
                let slot = pass.trailing_zeros() as usize;
                pass &= pass - 1;
                if poll_one(slot) {
                    keep &= !(1 << slot);
                }
                // Wakeups that landed during the poll: slots above the one
                // just polled join this pass; the rest (including a self
                // re-poll) wait for the next.
                if self.state.load(Ordering::Relaxed) & (WAKEUPS_MASK | QUEUED_MASK) != 0 {
                    let drained = self
                        .state
                        .fetch_and(!(WAKEUPS_MASK | QUEUED_MASK), Ordering::AcqRel);
                    let bits = wakeups(drained) | queued(drained);
                    let above = bits & !(((1u32 << (slot + 1)) - 1) as WakeupMask);
                    pass |= above;
                    carry |= bits & !above;
                }
            }
            let freed = !keep;
            if freed != 0 {
                // Retire this pass's completions without giving up the lock:
                // their allocation bits (and any wake bits they accrued
                // while retiring) clear now, so slot pressure stays bounded
                // however long wakeups extend this tenure. A wake for a slot
                // freed here was addressed to the retired participant and is
                // dropped; reuse cannot have happened before this clear.
                carry &= keep;
                self.state.fetch_and(
                    !(pack_allocated(freed) | pack_wakeups(freed) | pack_queued(freed)),
                    Ordering::AcqRel,
                );
            }
            if carry != 0 {
                continue;
            }
            // Release the lock. If a wakeup beat the release, run another
            // pass instead.
            let mut expected = self.state.load(Ordering::Relaxed);
            loop {
                if expected & (WAKEUPS_MASK | QUEUED_MASK) != 0 {
                    break;
                }
                debug_assert!(expected & LOCKED_BIT != 0);
                let next = expected & !LOCKED_BIT;
                match self.state.compare_exchange_weak(
                    expected,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        debug_check(next);
                        return refs(next) == 0 && allocated(next) == 0;
                    }
                    Err(actual) => expected = actual,
                }
            }
        }
    }
}

/// The five fields of [`PartySyncUsingMutex`], unpacked.
#[derive(Debug)]
struct MutexState {
    refs: u64,
    locked: bool,
    allocated: WakeupMask,
    wakeups: WakeupMask,
    add_queued: WakeupMask,
}

/// Mutex-based implementation: the same five fields and transitions, under
/// one lock.
///
/// The run-lock is try-acquire (a losing waker delegates its wakeup to the
/// current holder and leaves), so no blocking wait — and hence no condvar —
/// is needed; every transition is a short critical section.
#[derive(Debug)]
pub struct PartySyncUsingMutex {
    state: Mutex<MutexState>,
}

impl PartySync for PartySyncUsingMutex {
    fn new(initial_refs: usize) -> Self {
        assert!(initial_refs as u64 <= MAX_REFS, "initial ref count too large");
        Self {
            state: Mutex::new(MutexState {
                refs: initial_refs as u64,
                locked: false,
                allocated: 0,
                wakeups: 0,
                add_queued: 0,
            }),
        }
    }

    fn incr_ref_count(&self) {
        let mut s = self.state.lock();
        assert!(s.refs < MAX_REFS, "party reference count overflow");
        s.refs += 1;
    }

    fn ref_if_non_zero(&self) -> bool {
        let mut s = self.state.lock();
        if s.refs == 0 {
            return false;
        }
        assert!(s.refs < MAX_REFS, "party reference count overflow");
        s.refs += 1;
        true
    }

    fn unref(&self) -> bool {
        let mut s = self.state.lock();
        debug_assert!(s.refs > 0, "unref of a dead party");
        s.refs -= 1;
        s.refs == 0 && !s.locked && s.allocated == 0
    }

    fn add_participants_and_ref<F>(&self, count: usize, assign: F) -> Option<bool>
    where
        F: FnOnce(&[usize]),
    {
        debug_assert!(count >= 1 && count <= MAX_PARTICIPANTS);
        let mut slots = [0usize; MAX_PARTICIPANTS];
        let mask = {
            let mut s = self.state.lock();
            debug_assert!(s.refs > 0, "spawn on an orphaned party");
            assert!(s.refs < MAX_REFS, "party reference count overflow");
            let mut reserve: WakeupMask = 0;
            let mut found = 0;
            for bit in 0..MAX_PARTICIPANTS {
                if found == count {
                    break;
                }
                if s.allocated & (1 << bit) == 0 {
                    slots[found] = bit;
                    reserve |= 1 << bit;
                    found += 1;
                }
            }
            if found < count {
                return None;
            }
            s.allocated |= reserve;
            s.refs += 1;
            reserve
        };
        assign(&slots[..count]);
        let mut s = self.state.lock();
        s.wakeups |= mask;
        s.add_queued |= mask;
        let acquired = !s.locked;
        s.locked = true;
        Some(acquired)
    }

    fn schedule_wakeup(&self, mask: WakeupMask) -> bool {
        let mut s = self.state.lock();
        let wake = mask & s.allocated;
        if wake == 0 {
            return false;
        }
        s.wakeups |= wake;
        let acquired = !s.locked;
        s.locked = true;
        acquired
    }

    fn force_immediate_repoll(&self, mask: WakeupMask) {
        let mut s = self.state.lock();
        debug_assert!(s.locked, "repoll outside the run loop");
        s.wakeups |= mask;
    }

    fn run_party<F>(&self, mut poll_one: F) -> bool
    where
        F: FnMut(usize) -> bool,
    {
        let mut carry: WakeupMask = 0;
        loop {
            let mut pass = {
                let mut s = self.state.lock();
                debug_assert!(s.locked, "run loop without the run-lock");
                let bits = s.wakeups | s.add_queued;
                s.wakeups = 0;
                s.add_queued = 0;
                bits | carry
            };
            carry = 0;
            let mut keep: WakeupMask = WakeupMask::MAX;
            while pass != 0 {
                let slot = pass.trailing_zeros() as usize;
                pass &= pass - 1;
                if poll_one(slot) {
                    keep &= !(1 << slot);
                }
                let mut s = self.state.lock();
                if s.wakeups | s.add_queued != 0 {
                    let bits = s.wakeups | s.add_queued;
                    s.wakeups = 0;
                    s.add_queued = 0;
                    let above = bits & !(((1u32 << (slot + 1)) - 1) as WakeupMask);
                    pass |= above;
                    carry |= bits & !above;
                }
            }
            let freed = !keep;
            if freed != 0 {
                // Retire this pass's completions while still holding the
                // run-lock; see the atomics variant for the reasoning.
                carry &= keep;
                let mut s = self.state.lock();
                s.allocated &= keep;
                s.wakeups &= keep;
                s.add_queued &= keep;
            }
            if carry != 0 {
                continue;
            }
            let mut s = self.state.lock();
            if s.wakeups | s.add_queued != 0 {
                continue;
            }
            s.locked = false;
            return s.refs == 0 && s.allocated == 0;
        }
    }
}
