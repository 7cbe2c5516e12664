//! Candidate ordering (C1) and orphan/dependency tracking (C2).
//!
//! The heap deliberately does not use `std::collections::BinaryHeap`:
//! that type bakes its `Ord` into the element at insertion time, and the
//! builder needs to flip the whole queue from priority order to fee
//! order mid-build without rebuilding every `Candidate`. Instead this is
//! a hand-rolled binary heap over a `Vec<Candidate>` with the comparator
//! stored alongside it as data, swappable via [`CandidateQueue::flip_to_fee_mode`].

use komodo_utxo::{OutPoint, Transaction, UtxoError, UtxoView};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Sentinel priority granted to the block's one notarisation transaction
/// (§4.3) so it always sorts to the front of a priority-mode heap.
pub const NOTARISATION_PRIORITY: f64 = 1e16;

#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("utxo error: {0}")]
    Utxo(#[from] UtxoError),
}

/// A mempool-resident transaction plus the fee/priority deltas an
/// operator may have applied (`prioritisetransaction`-style overrides).
/// The mining crate never mutates a mempool itself (storage and
/// validation are external collaborators, §1) — this is the read
/// contract it scores against.
pub trait MempoolView {
    fn entries(&self) -> Vec<MempoolEntry>;
    fn delta_priority(&self, txid: &[u8; 32]) -> f64;
    fn delta_fee(&self, txid: &[u8; 32]) -> i64;
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: [u8; 32],
}

/// Minimal in-memory mempool used by tests and by the daemon's offline
/// `mine` path in place of a real node's transaction pool.
#[derive(Debug, Default)]
pub struct InMemoryMempool {
    entries: HashMap<[u8; 32], MempoolEntry>,
    delta_priority: HashMap<[u8; 32], f64>,
    delta_fee: HashMap<[u8; 32], i64>,
}

impl InMemoryMempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tx: Transaction) -> Result<[u8; 32], MempoolError> {
        let txid = tx.txid()?;
        self.entries.insert(txid, MempoolEntry { tx, txid });
        Ok(txid)
    }

    pub fn set_deltas(&mut self, txid: [u8; 32], delta_priority: f64, delta_fee: i64) {
        self.delta_priority.insert(txid, delta_priority);
        self.delta_fee.insert(txid, delta_fee);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MempoolView for InMemoryMempool {
    fn entries(&self) -> Vec<MempoolEntry> {
        self.entries.values().cloned().collect()
    }

    fn delta_priority(&self, txid: &[u8; 32]) -> f64 {
        self.delta_priority.get(txid).copied().unwrap_or(0.0)
    }

    fn delta_fee(&self, txid: &[u8; 32]) -> i64 {
        self.delta_fee.get(txid).copied().unwrap_or(0)
    }
}

/// `(priority, fee-rate, tx)` as scored during the template builder's
/// scoring pass (§4.4 step 4).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub priority: f64,
    pub fee_rate: f64,
    pub fee: i64,
    pub size: usize,
    pub sigops: usize,
    pub txid: [u8; 32],
    pub tx: Transaction,
    /// Raw `prioritisetransaction`-style override applied on top of this
    /// tx's own computed priority/fee. The free-tx gate tests these, not
    /// the blended totals above (§4.4 step 5, §6 `apply_deltas`) — a tx
    /// with a real fee but a negative operator override must still be
    /// treated as a free tx for the purpose of that gate.
    pub delta_priority: f64,
    pub delta_fee: i64,
}

/// The comparator mode a [`CandidateQueue`] is currently ordered under.
/// Kept as a tag alongside the heap's storage, not baked into
/// `Candidate`'s own `Ord` impl, so [`CandidateQueue::flip_to_fee_mode`]
/// can re-heapify in place without touching the elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMode {
    ByPriority,
    ByFee,
}

impl Default for OrderMode {
    fn default() -> Self {
        OrderMode::ByPriority
    }
}

fn compare(mode: OrderMode, a: &Candidate, b: &Candidate) -> Ordering {
    let primary = match mode {
        OrderMode::ByPriority => a.priority.partial_cmp(&b.priority),
        OrderMode::ByFee => a.fee_rate.partial_cmp(&b.fee_rate),
    }
    .unwrap_or(Ordering::Equal);
    if primary != Ordering::Equal {
        return primary;
    }
    match mode {
        OrderMode::ByPriority => a.fee_rate.partial_cmp(&b.fee_rate),
        OrderMode::ByFee => a.priority.partial_cmp(&b.priority),
    }
    .unwrap_or(Ordering::Equal)
}

/// Max-heap of [`Candidate`]s whose ordering can be flipped between
/// priority-mode and fee-mode at runtime (C1, §4.1, §9).
#[derive(Debug, Default)]
pub struct CandidateQueue {
    mode: OrderMode,
    heap: Vec<Candidate>,
}

impl CandidateQueue {
    pub fn new(mode: OrderMode) -> Self {
        CandidateQueue {
            mode,
            heap: Vec::new(),
        }
    }

    pub fn mode(&self) -> OrderMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, candidate: Candidate) {
        self.heap.push(candidate);
        self.sift_up(self.heap.len() - 1);
    }

    /// Removes and returns the current head (highest by the active mode).
    pub fn pop(&mut self) -> Option<Candidate> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let top = self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        top
    }

    pub fn peek(&self) -> Option<&Candidate> {
        self.heap.first()
    }

    /// Switches the comparator to fee-mode and re-heapifies in place.
    /// Irreversible within one template build (§4.1: "flips ...
    /// permanently").
    pub fn flip_to_fee_mode(&mut self) {
        if self.mode == OrderMode::ByFee {
            return;
        }
        self.mode = OrderMode::ByFee;
        self.heapify();
    }

    fn heapify(&mut self) {
        if self.heap.len() < 2 {
            return;
        }
        for i in (0..self.heap.len() / 2).rev() {
            self.sift_down(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if compare(self.mode, &self.heap[i], &self.heap[parent]) == Ordering::Greater {
                self.heap.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut largest = i;
            if left < len
                && compare(self.mode, &self.heap[left], &self.heap[largest]) == Ordering::Greater
            {
                largest = left;
            }
            if right < len
                && compare(self.mode, &self.heap[right], &self.heap[largest])
                    == Ordering::Greater
            {
                largest = right;
            }
            if largest == i {
                break;
            }
            self.heap.swap(i, largest);
            i = largest;
        }
    }
}

/// A [`Candidate`] whose inputs are not yet fully resolved against the
/// UTXO view, parked until its mempool parents are admitted (C2).
#[derive(Debug, Clone)]
pub struct Orphan {
    pub candidate: Candidate,
    pub depends_on: Vec<[u8; 32]>,
}

/// Arena of parked [`Orphan`]s addressed by stable index, with a
/// `mapDependers`-equivalent index from parent txid to dependent orphan
/// slots (§9: never raw pointers or cyclic references between orphans).
#[derive(Debug, Default)]
pub struct DependencyTracker {
    arena: Vec<Option<Orphan>>,
    dependers: HashMap<[u8; 32], Vec<usize>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `orphan`, indexing it under each of its unresolved parents.
    pub fn add_orphan(&mut self, orphan: Orphan) {
        let slot = self.arena.len();
        for parent in &orphan.depends_on {
            self.dependers.entry(*parent).or_default().push(slot);
        }
        self.arena.push(Some(orphan));
    }

    /// Call once a `parent` txid has been admitted into the template.
    /// Returns the transaction of every orphan whose `depends_on` set is
    /// now empty. The caller re-scores each one against the
    /// just-updated view rather than trusting the priority/fee computed
    /// when it was first parked, since that was necessarily computed
    /// without its parent's now-available output.
    pub fn release_parent(&mut self, parent: &[u8; 32]) -> Vec<Transaction> {
        let mut released = Vec::new();
        let Some(slots) = self.dependers.remove(parent) else {
            return released;
        };
        for slot in slots {
            if let Some(orphan) = &mut self.arena[slot] {
                orphan.depends_on.retain(|p| p != parent);
                if orphan.depends_on.is_empty() {
                    if let Some(orphan) = self.arena[slot].take() {
                        released.push(orphan.candidate.tx);
                    }
                }
            }
        }
        released
    }

    /// Drops any orphan still waiting on a parent that is neither in the
    /// mempool nor the UTXO view — it can never be admitted.
    pub fn discard_unresolvable(&mut self, view: &dyn UtxoView, mempool_txids: &[[u8; 32]]) {
        for slot in self.arena.iter_mut() {
            let discard = match slot {
                Some(orphan) => orphan.depends_on.iter().any(|parent| {
                    !mempool_txids.contains(parent)
                        && !view.has_coin(&OutPoint {
                            txid: *parent,
                            vout: 0,
                        })
                }),
                None => false,
            };
            if discard {
                *slot = None;
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.arena.iter().filter(|o| o.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use komodo_utxo::TxOut;

    fn candidate(priority: f64, fee_rate: f64, id: u8) -> Candidate {
        Candidate {
            priority,
            fee_rate,
            fee: 0,
            size: 100,
            sigops: 0,
            txid: [id; 32],
            delta_priority: 0.0,
            delta_fee: 0,
            tx: Transaction {
                version: 1,
                vin: vec![],
                vout: vec![TxOut {
                    value: 1,
                    script_pubkey: vec![id],
                }],
                lock_time: 0,
                expiry_height: 0,
                shielded_spends: vec![],
                shielded_outputs: vec![],
                joinsplits: vec![],
                is_coinbase: false,
            },
        }
    }

    #[test]
    fn priority_mode_orders_by_priority_then_fee_rate() {
        let mut queue = CandidateQueue::new(OrderMode::ByPriority);
        queue.push(candidate(10.0, 5.0, 1));
        queue.push(candidate(20.0, 1.0, 2));
        queue.push(candidate(20.0, 9.0, 3));
        assert_eq!(queue.pop().unwrap().txid, [3u8; 32]);
        assert_eq!(queue.pop().unwrap().txid, [2u8; 32]);
        assert_eq!(queue.pop().unwrap().txid, [1u8; 32]);
    }

    #[test]
    fn flip_to_fee_mode_reorders_in_place() {
        let mut queue = CandidateQueue::new(OrderMode::ByPriority);
        queue.push(candidate(5.0, 100.0, 1));
        queue.push(candidate(50.0, 1.0, 2));
        // Priority mode: id 2 (higher priority) would come first.
        queue.flip_to_fee_mode();
        assert_eq!(queue.mode(), OrderMode::ByFee);
        // Fee mode: id 1 (higher fee-rate) now comes first.
        assert_eq!(queue.pop().unwrap().txid, [1u8; 32]);
        assert_eq!(queue.pop().unwrap().txid, [2u8; 32]);
    }

    #[test]
    fn notarisation_sentinel_always_wins_priority_mode() {
        let mut queue = CandidateQueue::new(OrderMode::ByPriority);
        queue.push(candidate(999_999.0, 1.0, 1));
        queue.push(candidate(NOTARISATION_PRIORITY, 0.0, 2));
        assert_eq!(queue.pop().unwrap().txid, [2u8; 32]);
    }

    #[test]
    fn dependency_tracker_releases_orphan_once_all_parents_admitted() {
        let mut tracker = DependencyTracker::new();
        let parent_a = [1u8; 32];
        let parent_b = [2u8; 32];
        let orphan_candidate = candidate(1.0, 1.0, 9);
        let expected_txid = orphan_candidate.tx.txid().unwrap();
        tracker.add_orphan(Orphan {
            candidate: orphan_candidate,
            depends_on: vec![parent_a, parent_b],
        });
        assert!(tracker.release_parent(&parent_a).is_empty());
        assert_eq!(tracker.pending_count(), 1);
        let released = tracker.release_parent(&parent_b);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].txid().unwrap(), expected_txid);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn unresolvable_orphan_is_discarded() {
        let mut tracker = DependencyTracker::new();
        let missing_parent = [3u8; 32];
        tracker.add_orphan(Orphan {
            candidate: candidate(1.0, 1.0, 8),
            depends_on: vec![missing_parent],
        });
        let view = komodo_utxo::InMemoryUtxoView::new();
        tracker.discard_unresolvable(&view, &[]);
        assert_eq!(tracker.pending_count(), 0);
    }
}
