use bytes::Bytes;
use hashbrown::HashMap;

use super::cluster::{RefcountDelta, ValueType};
use super::{ItemId, Rank};

/// First allocation holds this many entries; afterwards capacity doubles,
/// or grows to exactly fit a bulk insert when doubling falls short.
const FIRST_GROWTH: usize = 64;

fn grown_capacity(cap: usize, len: usize, extra: usize) -> usize {
    let mut next = if cap == 0 { FIRST_GROWTH } else { cap * 2 };
    if next < len + extra {
        next = len + extra;
    }
    next
}

/// "Target rank must learn that item\[subscript\] closed." An absent
/// subscript means the whole item closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankNotify {
    pub rank: Rank,
    pub id: ItemId,
    pub subscript: Option<Bytes>,
}

/// "This item\[subscript\] is a reference cell: write this value into it and
/// transfer the given refcount budget to the target's bookkeeping."
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefWrite {
    pub id: ItemId,
    pub subscript: Option<Bytes>,
    pub value: Bytes,
    pub vtype: ValueType,
    pub transfer: RefcountDelta,
}

/// A pending signed refcount delta. `must_preacquire` marks deltas that have
/// to land before any reference value derived from the same item reaches a
/// consumer, because the recipient will immediately acquire on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RcChange {
    pub id: ItemId,
    pub delta: RefcountDelta,
    pub must_preacquire: bool,
}

/// Close-event subscribers. Order-irrelevant; removal swaps with the last
/// entry and shrinks.
#[derive(Debug, Default)]
pub struct NotifyQueue {
    entries: Vec<RankNotify>,
}

impl NotifyQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reserve_for(&mut self, extra: usize) {
        let need = self.entries.len() + extra;
        if need <= self.entries.capacity() {
            return;
        }
        let target = grown_capacity(self.entries.capacity(), self.entries.len(), extra);
        self.entries.reserve_exact(target - self.entries.len());
    }

    pub fn push(&mut self, entry: RankNotify) {
        self.reserve_for(1);
        self.entries.push(entry);
    }

    pub fn get(&self, i: usize) -> &RankNotify {
        &self.entries[i]
    }

    pub fn swap_remove(&mut self, i: usize) -> RankNotify {
        self.entries.swap_remove(i)
    }

    /// Hands the backing storage to the caller, leaving the queue empty.
    /// Used by full drains, which never re-enter this queue.
    pub fn take_entries(&mut self) -> Vec<RankNotify> {
        std::mem::take(&mut self.entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RankNotify> {
        self.entries.iter()
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

/// Deferred reference-cell writes.
#[derive(Debug, Default)]
pub struct RefWriteQueue {
    entries: Vec<RefWrite>,
}

impl RefWriteQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reserve_for(&mut self, extra: usize) {
        let need = self.entries.len() + extra;
        if need <= self.entries.capacity() {
            return;
        }
        let target = grown_capacity(self.entries.capacity(), self.entries.len(), extra);
        self.entries.reserve_exact(target - self.entries.len());
    }

    pub fn push(&mut self, entry: RefWrite) {
        self.reserve_for(1);
        self.entries.push(entry);
    }

    pub fn get(&self, i: usize) -> &RefWrite {
        &self.entries[i]
    }

    pub fn swap_remove(&mut self, i: usize) -> RefWrite {
        self.entries.swap_remove(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RefWrite> {
        self.entries.iter()
    }
}

/// How `RcChangeSet::insert` handles a delta for an id that is already
/// queued. Selected at startup, not by conditional compilation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RcMergeStrategy {
    /// Append everything; duplicates are applied separately.
    Linear,
    /// Keep an id→position index and sum deltas in place on insert.
    Indexed,
}

/// Pending refcount deltas, optionally indexed by item id for O(1)
/// merge-on-insert.
#[derive(Debug)]
pub struct RcChangeSet {
    entries: Vec<RcChange>,
    index: Option<HashMap<ItemId, usize>>,
}

impl RcChangeSet {
    pub fn new(strategy: RcMergeStrategy) -> Self {
        let index = match strategy {
            RcMergeStrategy::Linear => None,
            RcMergeStrategy::Indexed => Some(HashMap::new()),
        };
        Self {
            entries: Vec::new(),
            index,
        }
    }

    pub fn strategy(&self) -> RcMergeStrategy {
        if self.index.is_some() {
            RcMergeStrategy::Indexed
        } else {
            RcMergeStrategy::Linear
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reserve_for(&mut self, extra: usize) {
        let need = self.entries.len() + extra;
        if need <= self.entries.capacity() {
            return;
        }
        let target = grown_capacity(self.entries.capacity(), self.entries.len(), extra);
        self.entries.reserve_exact(target - self.entries.len());
    }

    pub fn get(&self, i: usize) -> RcChange {
        self.entries[i]
    }

    /// Queues a delta. In indexed mode a delta for an already-queued id is
    /// summed into the existing entry (and `must_preacquire` flags are ORed:
    /// if either side must land before an acquire, the merged entry must).
    /// Returns true when the insert merged.
    pub fn insert(&mut self, change: RcChange) -> bool {
        if let Some(index) = self.index.as_mut() {
            if let Some(&pos) = index.get(&change.id) {
                let existing = &mut self.entries[pos];
                existing.delta.read += change.delta.read;
                existing.delta.write += change.delta.write;
                existing.must_preacquire |= change.must_preacquire;
                return true;
            }
        }
        self.reserve_for(1);
        let pos = self.entries.len();
        self.entries.push(change);
        if let Some(index) = self.index.as_mut() {
            index.insert(change.id, pos);
        }
        false
    }

    /// Swap-remove that keeps the position index correct: the entry swapped
    /// into the vacated slot gets its indexed position updated.
    pub fn swap_remove(&mut self, i: usize) -> RcChange {
        if let Some(index) = self.index.as_mut() {
            index.remove(&self.entries[i].id);
        }
        let removed = self.entries.swap_remove(i);
        if i < self.entries.len() {
            if let Some(index) = self.index.as_mut() {
                index.insert(self.entries[i].id, i);
            }
        }
        removed
    }

    pub fn contains(&self, id: ItemId) -> bool {
        match &self.index {
            Some(index) => index.contains_key(&id),
            None => self.entries.iter().any(|c| c.id == id),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RcChange> {
        self.entries.iter()
    }
}

/// The unit of cascading work attached to one data-store operation. Owns the
/// three effect queues by value and is threaded by exclusive ownership
/// through every cascading call. Payload bytes received from the network are
/// `Bytes` slices of the received blob, so the blob is released exactly when
/// the last entry referencing it is gone.
///
/// At the end of any top-level resolve, all three queues are empty.
#[derive(Debug)]
pub struct NotifySet {
    pub notify: NotifyQueue,
    pub references: RefWriteQueue,
    pub rc_changes: RcChangeSet,
}

impl NotifySet {
    pub fn new(strategy: RcMergeStrategy) -> Self {
        Self {
            notify: NotifyQueue::default(),
            references: RefWriteQueue::default(),
            rc_changes: RcChangeSet::new(strategy),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.notify.is_empty() && self.references.is_empty() && self.rc_changes.is_empty()
    }
}

impl Default for NotifySet {
    fn default() -> Self {
        Self::new(RcMergeStrategy::Indexed)
    }
}
