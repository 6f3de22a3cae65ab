//! The work queue ring: a fixed-capacity arena of work queue entries
//! indexed by sequence number modulo capacity.
//!
//! Head and tail are monotonic counters; a slot is reserved (and its
//! sequence number assigned) in one step under the ring lock, so slot
//! order and sequence order always agree. Hardware may report
//! completions out of order; results are staged per slot and entries
//! only retire from the tail in sequence order.

use crate::verbs::cq::{WcOpcode, WcStatus};
use crate::verbs::mr::RegionGuard;
use crate::verbs::type_alias::*;
use crate::verbs::wr::ResolvedSge;

/// A work queue entry as it sits in the ring.
#[derive(Debug)]
pub(crate) struct PostedWqe {
    pub seq: Seq,
    pub wr_id: WrId,
    pub opcode: WcOpcode,
    pub signaled: bool,
    pub total_len: u32,
    pub sgl: Vec<ResolvedSge>,

    /// In-flight references onto the regions the SGL resolves into.
    /// They keep the regions alive and unpinnable until the entry
    /// retires.
    pub guards: Vec<RegionGuard>,
}

struct Slot {
    wqe: PostedWqe,

    /// Completion result staged by the device, if any. The entry
    /// retires once every earlier entry has a result too.
    result: Option<(WcStatus, u32)>,
}

/// A retired work queue entry, ready to become a CQE.
pub(crate) struct Retired {
    pub wqe: PostedWqe,
    pub status: WcStatus,
    pub byte_len: u32,
}

pub(crate) struct WorkQueue {
    cap: u64,

    /// Next sequence number to assign (next free slot).
    head: Seq,

    /// Oldest unretired sequence number.
    tail: Seq,

    /// Receive side only: next entry to hand out for incoming delivery.
    next_match: Seq,

    slots: Vec<Option<Slot>>,
}

impl WorkQueue {
    /// Create a ring with at least `min_depth` slots. Capacity is
    /// rounded up to a power of two so that sequence numbers index
    /// slots by masking.
    pub fn new(min_depth: u32) -> Self {
        let cap = min_depth.max(1).next_power_of_two() as u64;
        let mut slots = Vec::with_capacity(cap as usize);
        slots.resize_with(cap as usize, || None);
        Self {
            cap,
            head: 0,
            tail: 0,
            next_match: 0,
            slots,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.cap as u32
    }

    /// Number of entries posted but not yet retired.
    #[inline]
    pub fn outstanding(&self) -> u32 {
        (self.head - self.tail) as u32
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.head - self.tail == self.cap
    }

    #[inline]
    fn idx(&self, seq: Seq) -> usize {
        (seq & (self.cap - 1)) as usize
    }

    /// Reserve the next slot and stamp the entry's sequence number.
    /// On a full ring the entry is handed back unchanged.
    pub fn try_enqueue(&mut self, mut wqe: PostedWqe) -> Result<Seq, PostedWqe> {
        if self.is_full() {
            return Err(wqe);
        }
        let seq = self.head;
        wqe.seq = seq;
        let idx = self.idx(seq);
        debug_assert!(self.slots[idx].is_none());
        self.slots[idx] = Some(Slot { wqe, result: None });
        self.head += 1;
        Ok(seq)
    }

    /// Peek the oldest unretired entry.
    #[allow(dead_code)]
    pub fn peek_oldest(&self) -> Option<&PostedWqe> {
        if self.tail == self.head {
            return None;
        }
        self.slots[self.idx(self.tail)].as_ref().map(|s| &s.wqe)
    }

    /// Stage a completion result for `seq` and retire every entry at
    /// the tail whose result is now known, in sequence order.
    ///
    /// Results for sequence numbers that are no longer outstanding
    /// (already retired or flushed) are dropped: the device may race a
    /// flush and deliver late.
    pub fn complete(&mut self, seq: Seq, status: WcStatus, byte_len: u32) -> Vec<Retired> {
        if seq < self.tail || seq >= self.head {
            return Vec::new();
        }
        let idx = self.idx(seq);
        if let Some(slot) = self.slots[idx].as_mut() {
            if slot.result.is_none() {
                slot.result = Some((status, byte_len));
            }
        }
        self.advance_tail()
    }

    /// Retire entries from the tail while their results are staged,
    /// preserving post order.
    pub fn advance_tail(&mut self) -> Vec<Retired> {
        let mut retired = Vec::new();
        while self.tail < self.head {
            let idx = self.idx(self.tail);
            let ready = self.slots[idx]
                .as_ref()
                .map(|s| s.result.is_some())
                .unwrap_or(false);
            if !ready {
                break;
            }
            let slot = self.slots[idx].take().expect("checked above");
            let (status, byte_len) = slot.result.expect("checked above");
            retired.push(Retired {
                wqe: slot.wqe,
                status,
                byte_len,
            });
            self.tail += 1;
            if self.next_match < self.tail {
                self.next_match = self.tail;
            }
        }
        retired
    }

    /// Drain every outstanding entry with flush status, preserving the
    /// original post order. Entries with staged (but unreleased)
    /// results are flushed as well: the queue died before they could be
    /// delivered in order.
    pub fn flush(&mut self) -> Vec<Retired> {
        let mut retired = Vec::new();
        while self.tail < self.head {
            let idx = self.idx(self.tail);
            if let Some(slot) = self.slots[idx].take() {
                retired.push(Retired {
                    wqe: slot.wqe,
                    status: WcStatus::WrFlushErr,
                    byte_len: 0,
                });
            }
            self.tail += 1;
        }
        self.next_match = self.tail;
        retired
    }

    /// Receive side: hand out the next posted entry for an incoming
    /// message. The entry stays outstanding until completed; matching
    /// only advances the match cursor.
    pub fn take_next_match(&mut self) -> Option<(Seq, Vec<ResolvedSge>, u32)> {
        if self.next_match >= self.head {
            return None;
        }
        let idx = self.idx(self.next_match);
        let slot = self.slots[idx].as_ref()?;
        let seq = slot.wqe.seq;
        let sgl = slot.wqe.sgl.clone();
        let cap = slot.wqe.total_len;
        self.next_match += 1;
        Some((seq, sgl, cap))
    }

    /// Clear the ring. Only legal when nothing is outstanding.
    pub fn reset(&mut self) {
        debug_assert_eq!(self.outstanding(), 0);
        self.head = 0;
        self.tail = 0;
        self.next_match = 0;
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wqe(wr_id: WrId) -> PostedWqe {
        PostedWqe {
            seq: 0,
            wr_id,
            opcode: WcOpcode::Send,
            signaled: true,
            total_len: 0,
            sgl: Vec::new(),
            guards: Vec::new(),
        }
    }

    #[test]
    fn test_enqueue_assigns_sequences() {
        let mut wq = WorkQueue::new(4);
        for i in 0..4 {
            assert_eq!(wq.try_enqueue(wqe(i)).unwrap(), i);
        }
        assert_eq!(wq.outstanding(), 4);
        assert_eq!(wq.peek_oldest().unwrap().wr_id, 0);
    }

    #[test]
    fn test_full_ring_rejects_without_mutation() {
        let mut wq = WorkQueue::new(2);
        wq.try_enqueue(wqe(0)).unwrap();
        wq.try_enqueue(wqe(1)).unwrap();
        assert!(wq.is_full());

        let rejected = wq.try_enqueue(wqe(2)).unwrap_err();
        assert_eq!(rejected.wr_id, 2);
        assert_eq!(wq.outstanding(), 2);

        // After a retire, the same enqueue succeeds.
        let retired = wq.complete(0, WcStatus::Success, 0);
        assert_eq!(retired.len(), 1);
        assert_eq!(wq.try_enqueue(rejected).unwrap(), 2);
    }

    #[test]
    fn test_out_of_order_results_retire_in_order() {
        let mut wq = WorkQueue::new(4);
        for i in 0..3 {
            wq.try_enqueue(wqe(i)).unwrap();
        }

        // Sequence 1 finishes before 0: nothing retires yet.
        assert!(wq.complete(1, WcStatus::Success, 11).is_empty());

        // Sequence 0 finishes: both retire, in order 0 then 1.
        let retired = wq.complete(0, WcStatus::Success, 10);
        assert_eq!(retired.len(), 2);
        assert_eq!(retired[0].wqe.seq, 0);
        assert_eq!(retired[0].byte_len, 10);
        assert_eq!(retired[1].wqe.seq, 1);
        assert_eq!(retired[1].byte_len, 11);

        let retired = wq.complete(2, WcStatus::Success, 12);
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].wqe.seq, 2);
    }

    #[test]
    fn test_stale_completion_is_dropped() {
        let mut wq = WorkQueue::new(4);
        wq.try_enqueue(wqe(0)).unwrap();
        wq.complete(0, WcStatus::Success, 0);
        assert!(wq.complete(0, WcStatus::Success, 0).is_empty());
        assert!(wq.complete(9, WcStatus::Success, 0).is_empty());
    }

    #[test]
    fn test_flush_preserves_order() {
        let mut wq = WorkQueue::new(8);
        for i in 0..5 {
            wq.try_enqueue(wqe(i)).unwrap();
        }
        // One result staged out of order; it is flushed with the rest.
        wq.complete(2, WcStatus::Success, 0);

        let flushed = wq.flush();
        assert_eq!(flushed.len(), 5);
        for (i, r) in flushed.iter().enumerate() {
            assert_eq!(r.wqe.seq, i as Seq);
            assert_eq!(r.status, WcStatus::WrFlushErr);
        }
        assert_eq!(wq.outstanding(), 0);
        assert!(wq.flush().is_empty());
    }

    #[test]
    fn test_recv_matching() {
        let mut wq = WorkQueue::new(4);
        wq.try_enqueue(wqe(0)).unwrap();
        wq.try_enqueue(wqe(1)).unwrap();

        let (seq, _, _) = wq.take_next_match().unwrap();
        assert_eq!(seq, 0);
        let (seq, _, _) = wq.take_next_match().unwrap();
        assert_eq!(seq, 1);
        assert!(wq.take_next_match().is_none());

        // Matched entries are still outstanding until completed.
        assert_eq!(wq.outstanding(), 2);
    }

    #[test]
    fn test_wraparound() {
        let mut wq = WorkQueue::new(2);
        for round in 0..10u64 {
            let seq = wq.try_enqueue(wqe(round)).unwrap();
            assert_eq!(seq, round);
            let retired = wq.complete(seq, WcStatus::Success, 0);
            assert_eq!(retired.len(), 1);
        }
    }
}
