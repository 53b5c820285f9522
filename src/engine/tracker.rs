//! Arena of outstanding transactions.
//!
//! Envelopes and messages refer back to their originating transactions by
//! [`TxnId`] rather than holding the acknowledgment directly. Each slot keeps a
//! reference count (one per copy of the batch still in flight) and the first
//! failure seen; the acknowledgment fires when the count reaches zero.
//!
//! A decoupling buffer hands its inputs off: their acknowledgments fire as
//! soon as the buffer takes the batch, and an internal transaction carrying
//! their admission permits follows the batch the rest of the way.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::{Ack, AckOutcome, Context, Envelope, TxnId};
use crate::error::BatchError;

struct Pending {
    ack: Ack,
    refs: usize,
    failure: Option<String>,
    permits: Vec<OwnedSemaphorePermit>,
    /// Created by a hand-off; not counted in the source-facing stats.
    internal: bool,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    pending: Option<Pending>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    outstanding: usize,
    high_water: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    pub filtered: u64,
    pub outstanding: usize,
    pub high_water: usize,
}

pub struct AckTracker {
    arena: Mutex<Arena>,
    permits: Arc<Semaphore>,
    capacity: usize,
    received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    filtered: AtomicU64,
}

impl AckTracker {
    /// `capacity` bounds how many transactions may be unresolved at once.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            arena: Mutex::new(Arena::default()),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            received: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for room to admit another transaction. `None` if `ctx` is cancelled first.
    pub async fn admit(&self, ctx: &Context) -> Option<OwnedSemaphorePermit> {
        ctx.run(self.permits.clone().acquire_owned())
            .await
            .and_then(|permit| permit.ok())
    }

    /// Start tracking a transaction. The permit is released once it resolves.
    pub fn register(&self, ack: Ack, permit: OwnedSemaphorePermit) -> TxnId {
        let pending = Pending {
            ack,
            refs: 1,
            failure: None,
            permits: vec![permit],
            internal: false,
        };
        let id = insert(&mut self.lock(), pending);
        self.received.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Acknowledge `owners` as successful and replace them with one internal
    /// transaction that inherits their admission permits, so the in-flight bound
    /// still covers the batch. `None` if no owner was still outstanding.
    pub fn hand_off(&self, owners: &[TxnId]) -> Option<TxnId> {
        let (completed, id) = {
            let mut arena = self.lock();
            let mut completed = owners
                .iter()
                .filter_map(|id| self.release(&mut arena, *id, &AckOutcome::Success))
                .collect::<Vec<_>>();
            if completed.is_empty() {
                return None;
            }

            let permits = completed
                .iter_mut()
                .flat_map(|(pending, _)| pending.permits.drain(..))
                .collect();
            let pending = Pending {
                ack: Ack::noop(),
                refs: 1,
                failure: None,
                permits,
                internal: true,
            };
            (completed, insert(&mut arena, pending))
        };
        self.finish(completed);
        Some(id)
    }

    /// Add `extra` outstanding copies for each owner, before a batch is fanned out.
    pub fn retain(&self, owners: &[TxnId], extra: usize) {
        if extra == 0 {
            return;
        }
        let mut arena = self.lock();
        for id in owners {
            if let Some(pending) = live_mut(&mut arena, *id) {
                pending.refs += extra;
            }
        }
    }

    /// Release one copy held by each owner with the same outcome.
    pub fn resolve(&self, owners: &[TxnId], outcome: &AckOutcome) {
        let completed = {
            let mut arena = self.lock();
            owners
                .iter()
                .filter_map(|id| self.release(&mut arena, *id, outcome))
                .collect::<Vec<_>>()
        };
        self.finish(completed);
    }

    /// Owners of a batch that was filtered to nothing; they resolve as successful.
    pub fn filtered(&self, owners: &[TxnId]) {
        let counted = {
            let mut arena = self.lock();
            owners
                .iter()
                .filter(|id| live_mut(&mut arena, **id).is_some_and(|p| !p.internal))
                .count()
        };
        self.filtered.fetch_add(counted as u64, Ordering::Relaxed);
        self.resolve(owners, &AckOutcome::Success);
    }

    /// Resolve a delivered batch where some messages were rejected.
    ///
    /// Rejected messages fail the transactions in their provenance; every other
    /// owner succeeds. A rejected message without provenance fails all owners.
    pub fn resolve_partial(&self, envelope: &Envelope, error: &BatchError) {
        let mut failed: BTreeMap<TxnId, &str> = BTreeMap::new();
        let mut fail_all = None;

        for (index, reason) in error.failed() {
            match envelope.batch.get(*index) {
                Some(message) if !message.provenance().is_empty() => {
                    for id in message.provenance() {
                        failed.entry(*id).or_insert(reason.as_str());
                    }
                }
                _ => {
                    fail_all.get_or_insert(reason.as_str());
                }
            }
        }

        for owner in envelope.owners() {
            let outcome = match fail_all.or_else(|| failed.get(owner).copied()) {
                Some(reason) => AckOutcome::failure(reason),
                None => AckOutcome::Success,
            };
            self.resolve(std::slice::from_ref(owner), &outcome);
        }
    }

    /// Fail every transaction still outstanding. Returns how many were failed.
    pub fn fail_outstanding(&self, reason: &str) -> usize {
        let completed = {
            let mut arena = self.lock();
            let mut completed = Vec::new();
            for index in 0..arena.slots.len() {
                let slot = &mut arena.slots[index];
                if let Some(mut pending) = slot.pending.take() {
                    slot.generation = slot.generation.wrapping_add(1);
                    let failure = pending.failure.take().unwrap_or_else(|| reason.to_string());
                    arena.free.push(index as u32);
                    arena.outstanding -= 1;
                    completed.push((pending, AckOutcome::Failure(failure)));
                }
            }
            completed
        };
        let count = completed.len();
        self.finish(completed);
        count
    }

    fn release(
        &self,
        arena: &mut Arena,
        id: TxnId,
        outcome: &AckOutcome,
    ) -> Option<(Pending, AckOutcome)> {
        let Some(pending) = live_mut(arena, id) else {
            tracing::warn!(txn = %id, "acknowledgment for a transaction that is not outstanding");
            return None;
        };

        if let AckOutcome::Failure(reason) = outcome {
            pending.failure.get_or_insert_with(|| reason.clone());
        }
        pending.refs = pending.refs.saturating_sub(1);
        if pending.refs > 0 {
            return None;
        }

        let slot = &mut arena.slots[id.index()];
        let pending = slot.pending.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        arena.free.push(id.index() as u32);
        arena.outstanding -= 1;

        let outcome = match &pending.failure {
            Some(reason) => AckOutcome::Failure(reason.clone()),
            None => AckOutcome::Success,
        };
        Some((pending, outcome))
    }

    /// Run acknowledgments outside the arena lock.
    fn finish(&self, completed: Vec<(Pending, AckOutcome)>) {
        for (pending, outcome) in completed {
            if pending.internal {
                if let AckOutcome::Failure(reason) = &outcome {
                    tracing::warn!(%reason, "buffered batch failed after its inputs were acknowledged");
                }
                continue;
            }
            if outcome.is_success() {
                self.acked.fetch_add(1, Ordering::Relaxed);
            } else {
                self.nacked.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%outcome, "transaction nacked");
            }
            pending.ack.resolve(outcome);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    pub fn high_water(&self) -> usize {
        self.lock().high_water
    }

    pub fn stats(&self) -> TrackerStats {
        let arena = self.lock();
        TrackerStats {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            outstanding: arena.outstanding,
            high_water: arena.high_water,
        }
    }
}

fn insert(arena: &mut Arena, pending: Pending) -> TxnId {
    let index = match arena.free.pop() {
        Some(index) => index,
        None => {
            arena.slots.push(Slot::default());
            (arena.slots.len() - 1) as u32
        }
    };
    let slot = &mut arena.slots[index as usize];
    slot.pending = Some(pending);
    let id = TxnId::new(index, slot.generation);

    arena.outstanding += 1;
    arena.high_water = arena.high_water.max(arena.outstanding);
    id
}

fn live_mut(arena: &mut Arena, id: TxnId) -> Option<&mut Pending> {
    arena
        .slots
        .get_mut(id.index())
        .filter(|slot| slot.generation == id.generation())
        .and_then(|slot| slot.pending.as_mut())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Batch, Message};
    use std::sync::Mutex as StdMutex;

    fn recording() -> (Ack, Arc<StdMutex<Vec<AckOutcome>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let ack = Ack::new(move |outcome| sink.lock().unwrap().push(outcome));
        (ack, seen)
    }

    async fn admit(tracker: &AckTracker, ack: Ack) -> TxnId {
        let permit = tracker.admit(&Context::background()).await.unwrap();
        tracker.register(ack, permit)
    }

    #[tokio::test]
    async fn test_hand_off_acks_inputs_and_keeps_permits() {
        let tracker = AckTracker::new(2);
        let (first, first_seen) = recording();
        let (second, second_seen) = recording();
        let a = admit(&tracker, first).await;
        let b = admit(&tracker, second).await;

        let downstream = tracker.hand_off(&[a, b]).unwrap();
        assert_eq!(*first_seen.lock().unwrap(), vec![AckOutcome::Success]);
        assert_eq!(*second_seen.lock().unwrap(), vec![AckOutcome::Success]);
        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(tracker.permits.available_permits(), 0);
        assert!(tracker.hand_off(&[a]).is_none());

        tracker.resolve(&[downstream], &AckOutcome::failure("output down"));
        let stats = tracker.stats();
        assert_eq!((stats.received, stats.acked, stats.nacked), (2, 2, 0));
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.permits.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_resolves_once_after_all_copies() {
        let tracker = AckTracker::new(4);
        let (ack, seen) = recording();
        let id = admit(&tracker, ack).await;

        tracker.retain(&[id], 2);
        tracker.resolve(&[id], &AckOutcome::Success);
        tracker.resolve(&[id], &AckOutcome::failure("output b rejected"));
        assert!(seen.lock().unwrap().is_empty());

        tracker.resolve(&[id], &AckOutcome::Success);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![AckOutcome::Failure("output b rejected".into())]
        );

        // Stale id is ignored.
        tracker.resolve(&[id], &AckOutcome::Success);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(tracker.stats().nacked, 1);
    }

    #[tokio::test]
    async fn test_slot_reuse_bumps_generation() {
        let tracker = AckTracker::new(1);
        let first = admit(&tracker, Ack::noop()).await;
        tracker.resolve(&[first], &AckOutcome::Success);

        let (ack, seen) = recording();
        let second = admit(&tracker, ack).await;
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);

        tracker.resolve(&[first], &AckOutcome::failure("late"));
        assert!(seen.lock().unwrap().is_empty());
        tracker.resolve(&[second], &AckOutcome::Success);
        assert_eq!(*seen.lock().unwrap(), vec![AckOutcome::Success]);
    }

    #[tokio::test]
    async fn test_admit_blocks_at_capacity() {
        let tracker = AckTracker::new(1);
        let id = admit(&tracker, Ack::noop()).await;

        let (stop, ctx) = crate::core::shutdown_channel();
        stop.signal();
        assert!(tracker.admit(&ctx).await.is_none());

        tracker.resolve(&[id], &AckOutcome::Success);
        assert!(tracker.admit(&Context::background()).await.is_some());
        assert_eq!(tracker.high_water(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_maps_through_provenance() {
        let tracker = AckTracker::new(4);
        let (ack_a, seen_a) = recording();
        let (ack_b, seen_b) = recording();
        let a = admit(&tracker, ack_a).await;
        let b = admit(&tracker, ack_b).await;

        let mut first = Batch::single(Message::new("a"));
        first.stamp(a);
        let mut second = Batch::new(vec![Message::new("b1"), Message::new("b2")]);
        second.stamp(b);

        let merged = Envelope::merge([Envelope::new(first, a), Envelope::new(second, b)]).unwrap();
        tracker.resolve_partial(&merged, &BatchError::new().fail(2, "too large"));

        assert_eq!(*seen_a.lock().unwrap(), vec![AckOutcome::Success]);
        assert_eq!(
            *seen_b.lock().unwrap(),
            vec![AckOutcome::Failure("too large".into())]
        );
    }

    #[tokio::test]
    async fn test_partial_failure_without_provenance_fails_all() {
        let tracker = AckTracker::new(4);
        let (ack, seen) = recording();
        let id = admit(&tracker, ack).await;

        let envelope = Envelope::new(Batch::single(Message::new("fresh")), id);
        tracker.resolve_partial(&envelope, &BatchError::new().fail(0, "bad"));
        assert_eq!(*seen.lock().unwrap(), vec![AckOutcome::Failure("bad".into())]);
    }

    #[tokio::test]
    async fn test_fail_outstanding() {
        let tracker = AckTracker::new(4);
        let (ack, seen) = recording();
        admit(&tracker, ack).await;
        admit(&tracker, Ack::noop()).await;

        assert_eq!(tracker.fail_outstanding("stream terminated"), 2);
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![AckOutcome::Failure("stream terminated".into())]
        );
    }
}
