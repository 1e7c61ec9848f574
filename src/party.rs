//! The party: a unit of serial cooperative execution.
//!
//! A [`Party`] hosts up to [`MAX_PARTICIPANTS`](crate::sync::MAX_PARTICIPANTS)
//! polled computations that share an [`Arena`] and run serially: no two
//! participants of the same party are ever polled concurrently, while
//! different parties run in parallel on whatever [`Executor`] was injected.
//!
//! `Party` itself is the strong handle. Cloning takes a reference on the
//! party's state word, dropping releases it, and the party is torn down at
//! most once, when the reference count and the allocation bitmap are both
//! zero — by the dropping thread if the run-lock is free, else by the run
//! loop's own lock-release CAS once its last slot retires. Spawning
//! reserves the lowest free slot, installs the erased participant, and posts
//! the first run to the executor; wakeups from arbitrary threads re-enter
//! the party through the same word and poll only the flagged slots.

use crate::arena::Arena;
use crate::context;
use crate::error::SpawnError;
use crate::executor::Executor;
use crate::participant::{Participant, ParticipantTable};
use crate::poll::{Poll, Promise};
use crate::sync::{PartySync, PartySyncUsingAtomics, MAX_PARTICIPANTS};
use crate::waitable::{completion_pair, Waitable};
use smallvec::SmallVec;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};

/// Shared body of a party. Reached through strong [`Party`] handles and the
/// weak references inside non-owning wakers.
pub(crate) struct PartyInner {
    pub(crate) sync: PartySyncUsingAtomics,
    pub(crate) participants: ParticipantTable,
    arena: Arena,
    executor: Arc<dyn Executor>,
}

impl PartyInner {
    /// Drives the run loop; the caller must hold the run-lock. Returns
    /// `true` iff the lock release observed zero references and an empty
    /// allocation bitmap, in which case the caller performs teardown.
    fn run(self: &Arc<Self>) -> bool {
        self.sync.run_party(|slot| self.poll_one(slot))
    }

    /// Polls the participant in `slot` once, with the activity context
    /// installed. Returns `true` iff the participant completed and the slot
    /// was retired.
    fn poll_one(self: &Arc<Self>, slot: usize) -> bool {
        let mut cell = self.participants.cell(slot);
        let Some(mut participant) = cell.take() else {
            // A wake can land just as its participant retires; the drained
            // bit then points at an empty slot. Treat as a no-op poll.
            error!(slot, "participant was null (spurious wakeup observed)");
            return false;
        };
        let completed = {
            let _scope = context::enter(Arc::clone(self), slot);
            participant.poll()
        };
        if completed {
            self.participants.bump_generation(slot);
            trace!(slot, name = participant.name(), "participant completed");
            drop(cell);
            drop(participant);
        } else {
            *cell = Some(participant);
        }
        completed
    }

    /// Runs after the teardown claim. Claimed at most once, by whichever
    /// thread's unref or lock-release observed the reference count *and*
    /// the allocation bitmap both at zero — so by construction every slot
    /// has already retired. A participant that never completes keeps its
    /// allocation bit set and this is never reached.
    fn teardown(&self) {
        debug_assert_eq!(
            self.sync.allocated_mask(),
            0,
            "teardown claimed with live participants"
        );
        trace!("party torn down");
    }
}

impl Drop for PartyInner {
    fn drop(&mut self) {
        // Empty by the time the last reference disappears, except when an
        // orphaned party became unreachable with participants parked
        // forever. The protocol never tears such a party down; reclaiming
        // the unreachable body is what discards their state, without any
        // completion.
        for slot in 0..MAX_PARTICIPANTS {
            if let Some(participant) = self.participants.take(slot) {
                debug!(
                    slot,
                    name = participant.name(),
                    "discarding parked participant of an unreachable party"
                );
            }
        }
    }
}

impl fmt::Debug for PartyInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartyInner").field("sync", &self.sync).finish_non_exhaustive()
    }
}

/// A strong handle to a party.
///
/// Clones are cheap (one atomic add). When the last strong handle — and the
/// last owning [`Waker`](crate::waker::Waker) — is gone the party is
/// orphaned: no new work can arrive and non-owning wakers become inert, but
/// in-flight participants keep running until they complete, and the party
/// is torn down only once every allocated slot has retired. A participant
/// that never completes pins its party indefinitely.
pub struct Party {
    inner: Arc<PartyInner>,
}

impl Party {
    /// Creates a party owning `arena`, scheduling its runs on `executor`.
    #[must_use]
    pub fn make(arena: Arena, executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(PartyInner {
                sync: PartySyncUsingAtomics::new(1),
                participants: ParticipantTable::new(),
                arena,
                executor,
            }),
        }
    }

    /// Wraps a body whose reference count was already incremented on the
    /// caller's behalf.
    pub(crate) fn from_reffed(inner: Arc<PartyInner>) -> Self {
        Self { inner }
    }

    /// Attempts to turn a non-owning reference into a live handle. Fails —
    /// without touching anything beyond reference counts — once the party
    /// is orphaned.
    pub(crate) fn try_upgrade(weak: &Weak<PartyInner>) -> Option<Self> {
        let inner = weak.upgrade()?;
        if inner.sync.ref_if_non_zero() {
            Some(Self { inner })
        } else {
            None
        }
    }

    /// The party's context arena.
    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.inner.arena
    }

    /// Spawns a participant.
    ///
    /// Returns once the slot is reserved, not once the participant
    /// completes; the first poll happens on the executor. `on_done` is
    /// invoked exactly once with the value the promise produced, on
    /// whichever thread observed the completion — unless the promise
    /// reports [`Poll::Cancelled`], in which case the slot retires and
    /// `on_done` is dropped unused.
    ///
    /// # Errors
    ///
    /// [`SpawnError::Full`] if every slot is allocated.
    pub fn spawn<P, F>(&self, name: &'static str, promise: P, on_done: F) -> Result<(), SpawnError>
    where
        P: Promise + Send + 'static,
        F: FnOnce(P::Output) + Send + 'static,
    {
        let mut batch: SmallVec<[Participant; 4]> = SmallVec::new();
        batch.push(erase(name, promise, on_done));
        self.add_participants(batch)
    }

    /// Spawns a participant and returns a [`Waitable`] that completes with
    /// its value, pollable from another party.
    ///
    /// If the participant retires without producing a value — it returned
    /// [`Poll::Cancelled`], or it was discarded because its party became
    /// unreachable while parked — the waitable observes
    /// [`Poll::Cancelled`].
    ///
    /// # Errors
    ///
    /// [`SpawnError::Full`] if every slot is allocated.
    pub fn spawn_waitable<P>(
        &self,
        name: &'static str,
        promise: P,
    ) -> Result<Waitable<P::Output>, SpawnError>
    where
        P: Promise + Send + 'static,
        P::Output: Send + 'static,
    {
        let (completer, waitable) = completion_pair();
        self.spawn(name, promise, move |value| completer.complete(value))?;
        Ok(waitable)
    }

    /// Starts a bulk spawn: participants staged on the returned spawner all
    /// become visible in one atomic step when it commits (explicitly or at
    /// scope exit), so siblings are first polled within the same pass.
    #[must_use]
    pub fn bulk_spawner(&self) -> BulkSpawner<'_> {
        BulkSpawner {
            party: self,
            staged: SmallVec::new(),
        }
    }

    /// Wakes `slot` (current-thread flavor): sets the wake bit and, if that
    /// acquired the run-lock, drives the run loop on this stack.
    pub(crate) fn wakeup_slot(&self, slot: usize, generation: u32) {
        if self.inner.participants.generation(slot) != generation {
            trace!(slot, "stale wakeup for a reused slot ignored");
            return;
        }
        if self.inner.sync.schedule_wakeup(1 << slot) {
            self.run_locked();
        }
    }

    /// Wakes `slot` on the executor instead of this thread; safe to call
    /// while holding locks a participant might take.
    pub(crate) fn wakeup_slot_async(&self, slot: usize, generation: u32) {
        let party = self.clone();
        self.inner
            .executor
            .run(Box::new(move || party.wakeup_slot(slot, generation)));
    }

    /// Runs the party; the current thread holds the run-lock.
    fn run_locked(&self) {
        if self.inner.run() {
            self.inner.teardown();
        }
    }

    /// Installs a batch of participants through one reservation CAS and, if
    /// that acquired the run-lock, posts the run to the executor.
    fn add_participants(&self, batch: SmallVec<[Participant; 4]>) -> Result<(), SpawnError> {
        let count = batch.len();
        debug_assert!(count > 0);
        let inner = &self.inner;
        let mut batch = Some(batch);
        let Some(acquired_lock) = inner.sync.add_participants_and_ref(count, |slots| {
            let batch = batch.take().expect("assign runs once");
            for (participant, &slot) in batch.into_iter().zip(slots) {
                trace!(slot, name = participant.name(), "participant spawned");
                inner.participants.install(slot, participant);
            }
        }) else {
            return Err(SpawnError::Full);
        };
        if acquired_lock {
            // Transfer the reservation's reference into the posted run: the
            // first poll happens on a worker, never on the spawner's stack.
            let runner = Party::from_reffed(Arc::clone(inner));
            inner.executor.run(Box::new(move || runner.run_locked()));
        } else {
            // Another thread holds the run-lock and will drain the new wake
            // bits; just release the reservation's reference. `self` still
            // holds one, so this cannot be the teardown claim.
            let claimed = inner.sync.unref();
            debug_assert!(!claimed, "live spawn handle kept the party alive");
        }
        Ok(())
    }
}

impl Clone for Party {
    fn clone(&self) -> Self {
        self.inner.sync.incr_ref_count();
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Party {
    fn drop(&mut self) {
        if self.inner.sync.unref() {
            self.inner.teardown();
        }
    }
}

impl fmt::Debug for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Party").field("sync", &self.inner.sync).finish_non_exhaustive()
    }
}

/// Erases a promise and its continuation into one participant closure:
/// polling it returns `true` exactly when the slot can be retired.
fn erase<P, F>(name: &'static str, mut promise: P, on_done: F) -> Participant
where
    P: Promise + Send + 'static,
    F: FnOnce(P::Output) + Send + 'static,
{
    let mut on_done = Some(on_done);
    Participant::new(
        name,
        Box::new(move || match promise.poll() {
            Poll::Ready(value) => {
                if let Some(deliver) = on_done.take() {
                    deliver(value);
                }
                true
            }
            Poll::Pending => false,
            Poll::Cancelled => {
                // Retire without delivering; the continuation is dropped.
                on_done = None;
                true
            }
        }),
    )
}

/// Stages several spawns and commits them in one atomic step.
///
/// Nothing staged here is visible to the party — or pollable — until the
/// spawner commits, which happens on [`commit`](Self::commit) or at scope
/// exit. All staged participants are then reserved by a single CAS, so the
/// first run pass observes every sibling's allocation bit at once.
pub struct BulkSpawner<'a> {
    party: &'a Party,
    staged: SmallVec<[Participant; 4]>,
}

impl BulkSpawner<'_> {
    /// Stages a participant; see [`Party::spawn`] for the semantics it will
    /// have once committed.
    pub fn spawn<P, F>(&mut self, name: &'static str, promise: P, on_done: F)
    where
        P: Promise + Send + 'static,
        F: FnOnce(P::Output) + Send + 'static,
    {
        self.staged.push(erase(name, promise, on_done));
    }

    /// Number of participants staged so far.
    #[must_use]
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Commits the staged participants now, reporting slot exhaustion
    /// instead of panicking as the scope-exit commit would.
    ///
    /// # Errors
    ///
    /// [`SpawnError::Full`] if fewer free slots remain than were staged; no
    /// staged participant is spawned in that case.
    pub fn commit(mut self) -> Result<(), SpawnError> {
        let party = self.party;
        let staged = std::mem::take(&mut self.staged);
        std::mem::forget(self);
        commit_staged(party, staged)
    }
}

impl Drop for BulkSpawner<'_> {
    fn drop(&mut self) {
        let staged = std::mem::take(&mut self.staged);
        commit_staged(self.party, staged).expect("no free participant slots for bulk spawn");
    }
}

impl fmt::Debug for BulkSpawner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkSpawner").field("staged", &self.staged.len()).finish()
    }
}

fn commit_staged(
    party: &Party,
    staged: SmallVec<[Participant; 4]>,
) -> Result<(), SpawnError> {
    if staged.is_empty() {
        return Ok(());
    }
    party.add_participants(staged)
}
