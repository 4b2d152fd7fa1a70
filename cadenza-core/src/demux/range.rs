// Cadenza
// Copyright (c) 2023-2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `range` module implements cached ranges and the range set: an LRU-ordered collection of
//! contiguous buffered intervals with byte-budget pruning and automatic joining of ranges that
//! have grown into one another.

use log::{debug, warn};

use crate::units::{ts_max, Ts};

use super::queue::Queue;

/// Per-track facts the cache needs while pruning, joining, and recomputing aggregates. Borrowed
/// from the demuxer state for the duration of one operation.
pub(crate) struct TrackView<'a> {
    /// Which tracks are selected.
    pub selected: &'a [bool],
    /// Which tracks pace read-ahead and participate strictly in joins.
    pub eager: &'a [bool],
    /// Reader head sequences in the current range, per track.
    pub heads: &'a [Option<u64>],
}

/// A contiguous buffered interval spanning all tracks: one packet queue per track plus the joint
/// seekable interval.
#[derive(Debug)]
pub(crate) struct CacheRange {
    pub queues: Vec<Queue>,
    /// Earliest time seekable in every selected track of this range.
    pub seek_start: Ts,
    /// Latest time seekable in every selected track of this range.
    pub seek_end: Ts,
}

impl CacheRange {
    fn new(num_tracks: usize) -> CacheRange {
        CacheRange {
            queues: (0..num_tracks).map(|_| Queue::new()).collect(),
            seek_start: None,
            seek_end: None,
        }
    }

    /// Recompute the joint seekable interval: the intersection of every selected track's
    /// interval. Any selected track without a closed keyframe block collapses the range to
    /// unknown, as does an empty intersection.
    pub fn update_seek_ranges(&mut self, selected: &[bool]) {
        self.seek_start = None;
        self.seek_end = None;

        let mut start: Ts = None;
        let mut end: Ts = None;

        for (i, queue) in self.queues.iter().enumerate() {
            if !selected.get(i).copied().unwrap_or(false) {
                continue;
            }
            match (queue.seek_start, queue.seek_end) {
                (Some(qs), Some(qe)) => {
                    start = Some(start.map_or(qs, |s: f64| s.max(qs)));
                    end = Some(end.map_or(qe, |e: f64| e.min(qe)));
                }
                _ => return,
            }
        }

        if let (Some(s), Some(e)) = (start, end) {
            if s <= e {
                self.seek_start = Some(s);
                self.seek_end = Some(e);
            }
        }
    }

    /// True if `pts` falls within the joint seekable interval.
    pub fn contains(&self, pts: f64) -> bool {
        match (self.seek_start, self.seek_end) {
            (Some(s), Some(e)) => s <= pts && pts <= e,
            _ => false,
        }
    }

    /// Total estimated size of all packets in the range.
    pub fn bytes(&self) -> usize {
        self.queues.iter().map(|q| q.iter_seq().map(|(_, p)| p.estimated_size()).sum::<usize>()).sum()
    }

    fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }
}

/// The set of cached ranges, ordered least-recently-used first. The last range is the current
/// range: the only one the producer appends to.
#[derive(Debug)]
pub(crate) struct PacketCache {
    pub ranges: Vec<CacheRange>,
    /// Estimated bytes of every packet in every range.
    pub total_bytes: usize,
    /// Estimated bytes from every selected track's reader head to the tail of the current range.
    pub fw_bytes: usize,
}

impl PacketCache {
    pub fn new(num_tracks: usize) -> PacketCache {
        PacketCache { ranges: vec![CacheRange::new(num_tracks)], total_bytes: 0, fw_bytes: 0 }
    }

    #[inline]
    pub fn num_tracks(&self) -> usize {
        self.ranges.last().map_or(0, |r| r.queues.len())
    }

    /// Register one more track: every range grows an empty queue for it.
    pub fn add_track(&mut self) {
        for range in &mut self.ranges {
            range.queues.push(Queue::new());
        }
    }

    #[inline]
    pub fn current(&self) -> &CacheRange {
        self.ranges.last().expect("cache always holds a current range")
    }

    #[inline]
    pub fn current_mut(&mut self) -> &mut CacheRange {
        self.ranges.last_mut().expect("cache always holds a current range")
    }

    /// Allocate a fresh empty range and make it current. Dead old ranges are dropped.
    pub fn push_new_current(&mut self, selected: &[bool]) {
        let num_tracks = self.num_tracks();
        self.ranges.push(CacheRange::new(num_tracks));
        self.fw_bytes = 0;
        self.drop_dead_ranges(selected);
    }

    /// Promote the range at `idx` to current by a stable remove and append.
    pub fn promote(&mut self, idx: usize, selected: &[bool]) {
        if idx + 1 != self.ranges.len() {
            let range = self.ranges.remove(idx);
            self.ranges.push(range);
        }
        self.drop_dead_ranges(selected);
    }

    /// Drop every non-current range whose joint seekable interval collapsed to unknown: it can
    /// never satisfy an in-cache seek again.
    pub fn drop_dead_ranges(&mut self, selected: &[bool]) {
        let mut i = 0;
        while i + 1 < self.ranges.len() {
            self.ranges[i].update_seek_ranges(selected);
            if self.ranges[i].seek_start.is_none() {
                let bytes = self.ranges[i].bytes();
                self.total_bytes -= bytes;
                self.ranges.remove(i);
            }
            else {
                i += 1;
            }
        }
    }

    /// Find a range whose joint seekable interval contains `pts`, preferring the current range.
    pub fn find_cached_range(&self, pts: f64) -> Option<usize> {
        (0..self.ranges.len()).rev().find(|&i| self.ranges[i].contains(pts))
    }

    /// Drop every packet in every range, leaving a single empty current range.
    pub fn clear(&mut self) {
        let num_tracks = self.num_tracks();
        self.ranges.clear();
        self.ranges.push(CacheRange::new(num_tracks));
        self.total_bytes = 0;
        self.fw_bytes = 0;
    }

    /// Recompute the forward byte total from the reader heads in the current range.
    pub fn recompute_fw_bytes(&mut self, tv: &TrackView<'_>) {
        let current = self.ranges.last().expect("cache always holds a current range");

        let mut fw = 0;
        for (i, queue) in current.queues.iter().enumerate() {
            if !tv.selected[i] {
                continue;
            }
            if let Some(head) = tv.heads[i] {
                for (seq, p) in queue.iter_seq() {
                    if seq >= head {
                        fw += p.estimated_size();
                    }
                }
            }
        }
        self.fw_bytes = fw;
    }

    /// Enforce the back-buffer byte budget: while the bytes behind the reader heads exceed
    /// `max_back_bytes`, drop head keyframe blocks from the least-recently-used range, choosing
    /// per iteration the track whose head block is most expendable. Reader heads are never
    /// dropped. Ranges emptied of their seekable interval are removed.
    pub fn prune(&mut self, max_back_bytes: usize, tv: &TrackView<'_>) {
        loop {
            if self.total_bytes - self.fw_bytes <= max_back_bytes {
                break;
            }

            let is_current = self.ranges.len() == 1;
            let range = &mut self.ranges[0];

            // Pick the victim track: any head that cannot anchor a seek must go first; otherwise
            // take the head with the earliest seekable entry time.
            let mut victim: Option<usize> = None;
            let mut victim_pts: Ts = None;
            let mut must_prune = false;

            for (i, queue) in range.queues.iter().enumerate() {
                let head = match queue.front() {
                    Some(head) => head,
                    None => continue,
                };
                if is_current && tv.heads[i] == queue.front_seq() {
                    continue;
                }

                let kf_pts = head.kf_seek_pts();
                let must = kf_pts.is_none() || !head.keyframe;

                if must {
                    if !must_prune {
                        must_prune = true;
                        victim = Some(i);
                    }
                }
                else if !must_prune {
                    let earlier = match (kf_pts, victim_pts) {
                        (Some(kf), Some(best)) => kf < best,
                        _ => victim.is_none(),
                    };
                    if earlier {
                        victim = Some(i);
                        victim_pts = kf_pts;
                    }
                }
            }

            let vi = match victim {
                Some(vi) => vi,
                None => {
                    // Nothing prunable here. A stale empty range can still be dropped.
                    if !is_current && range.is_empty() {
                        self.ranges.remove(0);
                        continue;
                    }
                    break;
                }
            };

            // Drop the head block: everything in front of the next closed keyframe boundary.
            let queue = &mut range.queues[vi];
            let target = queue.prune_target();

            while let Some(front) = queue.front_seq() {
                if target == Some(front) {
                    break;
                }
                if is_current && tv.heads[vi] == Some(front) {
                    break;
                }
                let p = queue.pop_front().expect("queue front exists");
                self.total_bytes -= p.estimated_size();
            }

            queue.seek_start = match target {
                Some(t) => queue.get(t).and_then(|p| p.kf_seek_pts()),
                None => None,
            };
            if queue.is_empty() {
                queue.seek_end = None;
            }

            range.update_seek_ranges(tv.selected);

            if !is_current && self.ranges[0].seek_start.is_none() {
                let bytes = self.ranges[0].bytes();
                self.total_bytes -= bytes;
                self.ranges.remove(0);
            }
        }
    }

    /// Attempt to join the current range with a range it has grown into. Called whenever the
    /// current range's seekable interval advances.
    ///
    /// The current range absorbs the overlapping range's packets after dropping the duplicated
    /// prefix; on any mismatch for an eager track the overlapping range is discarded instead.
    /// Returns the time to resume low-level reading from after a successful join.
    pub fn try_join(&mut self, tv: &TrackView<'_>) -> Option<f64> {
        let mut resume = None;

        loop {
            let cur_idx = self.ranges.len() - 1;
            if cur_idx == 0 {
                break;
            }

            let (cs, ce) = match (self.ranges[cur_idx].seek_start, self.ranges[cur_idx].seek_end) {
                (Some(cs), Some(ce)) => (cs, ce),
                _ => break,
            };

            // The nearest range starting within the current one.
            let mut cand: Option<(usize, f64)> = None;
            for (i, range) in self.ranges[..cur_idx].iter().enumerate() {
                if let Some(rs) = range.seek_start {
                    if cs <= rs && rs < ce && cand.map_or(true, |(_, best)| rs < best) {
                        cand = Some((i, rs));
                    }
                }
            }
            let (next_idx, _) = match cand {
                Some(cand) => cand,
                None => break,
            };

            if self.join_with(next_idx, tv) {
                let current = self.ranges.last_mut().expect("current range exists");
                current.update_seek_ranges(tv.selected);
                resume = current.seek_end.map(|e| e - 1.0);
                debug!("cache ranges joined, resuming demuxing at {:?}", resume);
                // The extended interval may now overlap yet another range.
                continue;
            }

            break;
        }

        resume
    }

    /// Join the current range with `next_idx`. Returns false (and discards the next range) if
    /// any eager track's packets cannot be spliced without a gap or mismatch.
    fn join_with(&mut self, next_idx: usize, tv: &TrackView<'_>) -> bool {
        let cur_idx = self.ranges.len() - 1;
        debug_assert!(next_idx < cur_idx);

        let (front, back) = self.ranges.split_at_mut(cur_idx);
        let cur = &mut back[0];
        let next = &mut front[next_idx];

        let mut ok = true;

        'tracks: for t in 0..cur.queues.len() {
            let q1 = &cur.queues[t];
            let q2 = &mut next.queues[t];

            if q2.is_empty() {
                // An eager track must have overlapping data in the next range; a lazy one is
                // read only opportunistically and may simply have none.
                if tv.eager[t] && !q1.is_empty() {
                    ok = false;
                    break 'tracks;
                }
                continue;
            }

            let use_dts = q1.correct_dts && q2.correct_dts;
            let use_pos = q1.correct_pos && q2.correct_pos;
            if !(use_dts || use_pos) {
                ok = false;
                break 'tracks;
            }

            let (tail_dts, tail_pts, tail_pos, tail_len) = match q1.back() {
                Some(tail) => (tail.dts, tail.pts, tail.pos, tail.data.len()),
                None => {
                    if tv.eager[t] {
                        ok = false;
                        break 'tracks;
                    }
                    // Lazy track with no buffered tail: keep the next range's packets whole.
                    continue;
                }
            };

            // Drop the prefix of the next range that the current range already covers.
            while let Some(head) = q2.front() {
                let past = if use_dts {
                    match (head.dts, tail_dts) {
                        (Some(a), Some(b)) => a < b,
                        _ => false,
                    }
                }
                else {
                    match (head.pos, tail_pos) {
                        (Some(a), Some(b)) => a < b,
                        _ => false,
                    }
                };
                if !past {
                    break;
                }
                let p = q2.pop_front().expect("queue front exists");
                self.total_bytes -= p.estimated_size();
            }

            // The first packet not behind the tail must be the tail itself.
            let anchored = q2.front().is_some_and(|head| {
                head.dts == tail_dts
                    && head.pts == tail_pts
                    && head.pos == tail_pos
                    && head.data.len() == tail_len
            });

            if anchored {
                let p = q2.pop_front().expect("queue front exists");
                self.total_bytes -= p.estimated_size();
                // The current range's copy of the anchor keyframe has an open block; the absorbed
                // copy already knows the block's entry time.
                cur.queues[t].set_tail_kf_seek_pts(p.kf_seek_pts());
            }
            else if tv.eager[t] {
                ok = false;
                break 'tracks;
            }
        }

        if !ok {
            let bytes = self.ranges[next_idx].bytes();
            self.total_bytes -= bytes;
            self.ranges.remove(next_idx);
            warn!("discarding unjoinable cache range");
            return false;
        }

        for t in 0..cur.queues.len() {
            let q2 = &mut next.queues[t];
            if !q2.is_empty() {
                cur.queues[t].concat_from(q2);
            }
        }

        self.ranges.remove(next_idx);
        true
    }

    /// Verify the cache's byte totals and interval bookkeeping. Debug builds call this after
    /// every mutating operation.
    #[cfg(debug_assertions)]
    pub fn debug_check(&self, tv: &TrackView<'_>) {
        let total: usize = self.ranges.iter().map(|r| r.bytes()).sum();
        assert_eq!(self.total_bytes, total, "total_bytes out of sync");

        let current = self.ranges.last().expect("current range exists");
        let mut fw = 0;
        for (i, queue) in current.queues.iter().enumerate() {
            if !tv.selected[i] {
                continue;
            }
            if let Some(head) = tv.heads[i] {
                assert!(queue.get(head).is_some(), "reader head points into the current queue");
                for (seq, p) in queue.iter_seq() {
                    if seq >= head {
                        fw += p.estimated_size();
                    }
                }
            }
        }
        assert_eq!(self.fw_bytes, fw, "fw_bytes out of sync");

        for range in &self.ranges {
            if let (Some(s), Some(e)) = (range.seek_start, range.seek_end) {
                assert!(s <= e, "inverted seek range");
            }
        }
    }
}
