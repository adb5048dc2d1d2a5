//! Producer-private out-of-order staging.
//!
//! An offset enqueue stages a chain for a future position in the logical
//! payload stream without advancing the producer index. Staged segments
//! commit when in-order enqueues advance the tail to exactly their start
//! position; commitment writes the segment's descriptor and folds its
//! length into the contiguous stream, all ahead of the producer's single
//! release publish. Everything here is touched only by the producer.

use fastpath_common::BufferDesc;

/// One staged segment.
#[derive(Debug, Clone, Copy)]
pub struct OooSeg {
    /// Logical payload position the chain is destined for.
    pub start: u32,
    /// Chain length in bytes.
    pub length: u32,
    /// Pool index of the chain root.
    pub buffer_index: u32,
    /// Producer sequence stamp carried into the descriptor.
    pub debug: u32,
}

/// Staged segments ordered by distance ahead of the tail.
#[derive(Debug, Default)]
pub struct OooList {
    segs: Vec<OooSeg>,
    staged_bytes: u32,
}

impl OooList {
    /// Whether anything is staged.
    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    /// Total staged payload bytes; charged against producer free space
    /// so a later commit can never overflow the ring.
    pub fn staged_bytes(&self) -> u32 {
        self.staged_bytes
    }

    /// Stage a chain `offset` bytes ahead of the current tail.
    pub fn add(&mut self, tail: u32, offset: u32, length: u32, buffer_index: u32, debug: u32) {
        let start = tail.wrapping_add(offset);
        let dist = offset;
        let at = self
            .segs
            .partition_point(|s| s.start.wrapping_sub(tail) < dist);
        self.segs.insert(
            at,
            OooSeg {
                start,
                length,
                buffer_index,
                debug,
            },
        );
        self.staged_bytes += length;
        tracing::trace!(start, length, buffer_index, "staged out-of-order segment");
    }

    /// Commit every staged segment whose start the advancing tail has
    /// reached. `emit` publishes one descriptor and reports whether the
    /// descriptor ring accepted it; on refusal the segment stays staged.
    /// Segments the tail has overtaken are a producer contract
    /// violation: diagnosed and discarded.
    ///
    /// Returns the payload bytes committed; `tail` is advanced past
    /// each committed segment.
    pub fn try_collect(
        &mut self,
        capacity: u32,
        tail: &mut u32,
        mut emit: impl FnMut(&OooSeg) -> bool,
    ) -> u32 {
        let mut collected = 0u32;

        'scan: loop {
            let mut idx = 0;
            while idx < self.segs.len() {
                let seg = self.segs[idx];
                let dist = seg.start.wrapping_sub(*tail);
                if dist == 0 {
                    if !emit(&seg) {
                        break 'scan;
                    }
                    *tail = tail.wrapping_add(seg.length);
                    collected += seg.length;
                    self.staged_bytes -= seg.length;
                    self.segs.remove(idx);
                    // The advance may have made another segment
                    // adjacent; rescan from the front.
                    continue 'scan;
                }
                if dist > capacity {
                    tracing::error!(
                        start = seg.start,
                        length = seg.length,
                        buffer_index = seg.buffer_index,
                        debug = seg.debug,
                        tail = *tail,
                        "staged segment overtaken by in-order enqueues; discarding"
                    );
                    self.staged_bytes -= seg.length;
                    self.segs.remove(idx);
                    continue;
                }
                idx += 1;
            }
            break;
        }

        collected
    }
}

impl OooSeg {
    /// Descriptor record for this segment at commit time.
    pub fn to_desc(&self) -> BufferDesc {
        BufferDesc {
            buffer_index: self.buffer_index,
            start: self.start,
            length: self.length,
            debug: self.debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_segment_commits() {
        let mut list = OooList::default();
        list.add(100, 0, 40, 7, 0);
        assert_eq!(list.staged_bytes(), 40);

        let mut tail = 100u32;
        let mut emitted = Vec::new();
        let collected = list.try_collect(1024, &mut tail, |s| {
            emitted.push(s.buffer_index);
            true
        });

        assert_eq!(collected, 40);
        assert_eq!(tail, 140);
        assert_eq!(emitted, vec![7]);
        assert!(list.is_empty());
        assert_eq!(list.staged_bytes(), 0);
    }

    #[test]
    fn test_gap_holds_until_reached() {
        let mut list = OooList::default();
        list.add(0, 50, 20, 3, 0);

        let mut tail = 0u32;
        assert_eq!(list.try_collect(1024, &mut tail, |_| true), 0);
        assert!(!list.is_empty());

        tail = 50;
        assert_eq!(list.try_collect(1024, &mut tail, |_| true), 20);
        assert_eq!(tail, 70);
    }

    #[test]
    fn test_chained_commits_cascade() {
        let mut list = OooList::default();
        list.add(10, 0, 5, 1, 0);
        list.add(10, 5, 7, 2, 0);

        let mut tail = 10u32;
        let mut order = Vec::new();
        let collected = list.try_collect(1024, &mut tail, |s| {
            order.push(s.buffer_index);
            true
        });

        assert_eq!(collected, 12);
        assert_eq!(tail, 22);
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_refused_emit_keeps_segment() {
        let mut list = OooList::default();
        list.add(0, 0, 8, 9, 0);

        let mut tail = 0u32;
        assert_eq!(list.try_collect(1024, &mut tail, |_| false), 0);
        assert!(!list.is_empty());
        assert_eq!(list.staged_bytes(), 8);
    }

    #[test]
    fn test_overtaken_segment_is_discarded() {
        let mut list = OooList::default();
        list.add(0, 4, 8, 5, 0);

        // Tail jumps past the staged start without landing on it.
        let mut tail = 64u32;
        assert_eq!(list.try_collect(16, &mut tail, |_| true), 0);
        assert!(list.is_empty());
        assert_eq!(list.staged_bytes(), 0);
    }
}
