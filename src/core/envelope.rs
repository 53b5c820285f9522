use std::fmt;

use super::Batch;

/// Index into the arena of outstanding transactions.
///
/// The generation distinguishes a reused slot from the transaction that
/// previously occupied it, so a stale id can never resolve a newer transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId {
    index: u32,
    generation: u32,
}

impl TxnId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// A batch in flight between stages, together with the transactions it owes
/// acknowledgment to.
///
/// The owner set is kept separately from per-message provenance so that a batch
/// filtered down to nothing still knows whom to acknowledge.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub batch: Batch,
    owners: Vec<TxnId>,
}

impl Envelope {
    pub(crate) fn new(batch: Batch, owner: TxnId) -> Self {
        Self {
            batch,
            owners: vec![owner],
        }
    }

    pub(crate) fn from_parts(batch: Batch, owners: Vec<TxnId>) -> Self {
        Self { batch, owners }
    }

    pub(crate) fn into_parts(self) -> (Batch, Vec<TxnId>) {
        (self.batch, self.owners)
    }

    pub fn owners(&self) -> &[TxnId] {
        &self.owners
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Concatenate envelopes in order; the result owes acknowledgment to every input's owners.
    pub fn merge(envelopes: impl IntoIterator<Item = Envelope>) -> Option<Envelope> {
        let mut iter = envelopes.into_iter();
        let mut merged = iter.next()?;
        for env in iter {
            merged.batch.append(env.batch);
            merged.owners.extend(env.owners);
        }
        merged.owners.sort_unstable();
        merged.owners.dedup();
        Some(merged)
    }
}
