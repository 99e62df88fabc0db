//! Priority queue with lazy deletion
//!
//! A min-queue over (due, seq, id) built on std's BinaryHeap, with a HashMap
//! as the source of truth so entries can be removed by id. Stale heap keys
//! are discarded on peek/pop. The (due, seq, id) key gives deterministic
//! ordering for waits that share a deadline.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

#[derive(Clone, Debug)]
struct Key {
    due: f64,
    seq: u64,
    id: u64,
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.due.to_bits() == other.due.to_bits() && self.seq == other.seq && self.id == other.id
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// total_cmp gives a stable ordering for every float bit pattern; the reverse
// turns std's max-heap into a min-heap.
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .total_cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.id.cmp(&other.id))
            .reverse()
    }
}

/// Min-priority queue supporting removal by id.
pub struct MinPq<M> {
    heap: BinaryHeap<Key>,
    live: HashMap<u64, (f64, u64, M)>,
}

impl<M> Default for MinPq<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MinPq<M> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    /// Add an entry. Returns false if the id is already queued.
    pub fn add(&mut self, id: u64, due: f64, seq: u64, meta: M) -> bool {
        if self.live.contains_key(&id) {
            return false;
        }
        self.live.insert(id, (due, seq, meta));
        self.heap.push(Key { due, seq, id });
        true
    }

    /// Remove an entry by id, returning its metadata.
    pub fn remove(&mut self, id: u64) -> Option<M> {
        self.live.remove(&id).map(|(_, _, m)| m)
    }

    /// The earliest due time among live entries.
    pub fn peek_due(&mut self) -> Option<f64> {
        self.drop_stale_top();
        self.heap.peek().map(|k| k.due)
    }

    /// Pop the earliest live entry as (id, due, seq, metadata).
    pub fn pop(&mut self) -> Option<(u64, f64, u64, M)> {
        loop {
            let k = self.heap.pop()?;
            match self.live.get(&k.id) {
                Some((due, seq, _)) if due.to_bits() == k.due.to_bits() && *seq == k.seq => {
                    let (due, seq, meta) = self.live.remove(&k.id).unwrap();
                    return Some((k.id, due, seq, meta));
                }
                // Stale key: the entry was removed after this key was pushed.
                _ => continue,
            }
        }
    }

    fn drop_stale_top(&mut self) {
        while let Some(k) = self.heap.peek() {
            let fresh = matches!(
                self.live.get(&k.id),
                Some((due, seq, _)) if due.to_bits() == k.due.to_bits() && *seq == k.seq
            );
            if fresh {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }
}
