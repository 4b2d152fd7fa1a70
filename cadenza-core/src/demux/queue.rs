// Cadenza
// Copyright (c) 2023-2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `queue` module implements the per-(track, range) packet queue.
//!
//! Packets live in a `VecDeque` addressed by monotone sequence numbers: the sequence of the front
//! packet only grows, so a sequence id (used for reader heads and prune targets) stays valid
//! under both tail growth and head pruning, with O(1) append and O(1) pop-front.

use std::collections::VecDeque;

use crate::formats::SeekFlags;
use crate::packet::Packet;
use crate::units::{ts_max, ts_min, Ts, TS_RESET_TOLERANCE};

/// The outcome of appending one packet to a queue.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Appended {
    /// Estimated size of the appended packet in bytes.
    pub size: usize,
    /// True if the append closed a keyframe block and moved the queue's seekable interval, so the
    /// containing range must refresh its aggregate (and may attempt a join).
    pub range_changed: bool,
}

/// A packet queue for one track within one cached range.
#[derive(Debug, Default)]
pub(crate) struct Queue {
    pkts: VecDeque<Packet>,
    /// Sequence number of the front packet. Sequences keep growing across clears so stale ids
    /// can never alias a later packet.
    seq0: u64,

    /// True while every packet so far carried a DTS strictly greater than its predecessor's.
    pub correct_dts: bool,
    /// True while every packet so far carried a byte position strictly greater than its
    /// predecessor's.
    pub correct_pos: bool,
    /// DTS of the most recently appended packet.
    pub last_dts: Ts,
    /// Byte position of the most recently appended packet.
    pub last_pos: Option<u64>,
    /// Highest playback timestamp seen, tolerating resets larger than [`TS_RESET_TOLERANCE`].
    pub last_ts: Ts,

    /// Sequence of the keyframe opening the block currently being formed.
    keyframe_latest: Option<u64>,
    /// Smallest timestamp folded into the open block.
    keyframe_pts: Ts,
    /// Largest timestamp folded into the open block.
    keyframe_end_pts: Ts,

    /// Earliest seekable presentation time in this queue. Set when the first keyframe block
    /// closes; moved forward by pruning.
    pub seek_start: Ts,
    /// Latest seekable presentation time in this queue. Advanced on every block close.
    pub seek_end: Ts,

    /// Cached sequence of the next keyframe boundary after the front, used by the pruner.
    next_prune_target: Option<u64>,
}

impl Queue {
    pub fn new() -> Queue {
        Queue { correct_dts: true, correct_pos: true, ..Default::default() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }

    /// Sequence of the front packet, if any.
    #[inline]
    pub fn front_seq(&self) -> Option<u64> {
        if self.pkts.is_empty() {
            None
        }
        else {
            Some(self.seq0)
        }
    }

    /// Sequence one past the back packet.
    #[inline]
    pub fn end_seq(&self) -> u64 {
        self.seq0 + self.pkts.len() as u64
    }

    /// Sequence of the back packet, if any.
    #[inline]
    pub fn back_seq(&self) -> Option<u64> {
        if self.pkts.is_empty() {
            None
        }
        else {
            Some(self.end_seq() - 1)
        }
    }

    pub fn get(&self, seq: u64) -> Option<&Packet> {
        if seq < self.seq0 {
            return None;
        }
        self.pkts.get((seq - self.seq0) as usize)
    }

    fn get_mut(&mut self, seq: u64) -> Option<&mut Packet> {
        if seq < self.seq0 {
            return None;
        }
        self.pkts.get_mut((seq - self.seq0) as usize)
    }

    pub fn front(&self) -> Option<&Packet> {
        self.pkts.front()
    }

    pub fn back(&self) -> Option<&Packet> {
        self.pkts.back()
    }

    /// Sequence of the packet following `seq`, if one exists.
    pub fn next_seq(&self, seq: u64) -> Option<u64> {
        if seq + 1 < self.end_seq() {
            Some(seq + 1)
        }
        else {
            None
        }
    }

    /// Iterate packets in order together with their sequence numbers.
    pub fn iter_seq(&self) -> impl Iterator<Item = (u64, &Packet)> {
        let seq0 = self.seq0;
        self.pkts.iter().enumerate().map(move |(i, p)| (seq0 + i as u64, p))
    }

    /// Append one packet, updating monotonicity flags, the highest-seen timestamp, and the
    /// keyframe-block accounting.
    pub fn append(&mut self, p: Packet) -> Appended {
        let size = p.estimated_size();
        let seq = self.end_seq();

        self.correct_dts &= p.dts.is_some() && self.last_dts.map_or(true, |l| p.dts.unwrap() > l);
        self.correct_pos &= p.pos.is_some() && self.last_pos.map_or(true, |l| p.pos.unwrap() > l);
        self.last_dts = p.dts;
        self.last_pos = p.pos;

        // The highest playback timestamp accepts any non-regressing value, and a large backward
        // jump is taken as a timestamp reset.
        let mut ts = p.ts();
        if p.segmented {
            ts = ts_min(ts, p.end);
        }
        if let Some(ts) = ts {
            if self.last_ts.map_or(true, |l| ts >= l || ts + TS_RESET_TOLERANCE < l) {
                self.last_ts = Some(ts);
            }
        }

        let mut range_changed = false;

        if p.keyframe {
            // A new keyframe closes the block formed so far and opens the next one.
            range_changed = self.close_block();
            self.keyframe_latest = Some(seq);
        }

        let bts = p.seek_ts();
        self.keyframe_pts = ts_min(self.keyframe_pts, bts);
        self.keyframe_end_pts = ts_max(self.keyframe_end_pts, bts);

        self.pkts.push_back(p);

        Appended { size, range_changed }
    }

    /// Close the keyframe block currently being formed, assigning the block's earliest
    /// presentation time to the keyframe that opened it and extending the queue's seekable
    /// interval. Called when the next keyframe arrives and when EOF ends the stream.
    ///
    /// Returns true if the seekable interval changed.
    pub fn close_block(&mut self) -> bool {
        let mut changed = false;

        if let Some(seq) = self.keyframe_latest.take() {
            let kf_pts = self.keyframe_pts;

            if let Some(head) = self.get_mut(seq) {
                head.kf_seek_pts = kf_pts;
            }

            if self.seek_start.is_none() && kf_pts.is_some() {
                self.seek_start = kf_pts;
                changed = true;
            }

            let end = ts_max(self.seek_end, self.keyframe_end_pts);
            if end != self.seek_end {
                self.seek_end = end;
                changed = true;
            }
        }

        self.keyframe_pts = None;
        self.keyframe_end_pts = None;

        changed
    }

    /// Remove and return the front packet.
    pub fn pop_front(&mut self) -> Option<Packet> {
        let p = self.pkts.pop_front()?;
        if self.keyframe_latest == Some(self.seq0) {
            self.keyframe_latest = None;
        }
        if self.next_prune_target == Some(self.seq0) {
            self.next_prune_target = None;
        }
        self.seq0 += 1;
        Some(p)
    }

    /// Drop every packet and reset all statistics. Sequence numbers continue from where they
    /// left off.
    pub fn clear(&mut self) {
        let seq0 = self.end_seq();
        *self = Queue::new();
        self.seq0 = seq0;
    }

    /// The sequence of the next keyframe boundary strictly after the front packet: the first
    /// later keyframe whose block has closed. Packets in front of it form the prunable head
    /// block. Computed lazily and cached; a cached boundary the front has caught up with is
    /// recomputed.
    pub fn prune_target(&mut self) -> Option<u64> {
        let front = self.front_seq()?;

        if let Some(target) = self.next_prune_target {
            if target > front {
                return Some(target);
            }
            self.next_prune_target = None;
        }

        let mut found = None;
        for (seq, p) in self.iter_seq() {
            if seq <= front {
                continue;
            }
            if p.keyframe && p.kf_seek_pts.is_some() {
                found = Some(seq);
                break;
            }
        }

        if found.is_some() {
            self.next_prune_target = found;
        }

        found
    }

    /// Find the packet to resume reading from for a seek to `pts`: the keyframe whose closed
    /// block has the seekable entry time nearest to `pts` — at or before it, unless
    /// [`SeekFlags::FORWARD`] asks for at or after. Equal distances resolve to the earlier
    /// packet.
    pub fn find_seek_target(&self, pts: f64, flags: SeekFlags) -> Option<u64> {
        let forward = flags.contains(SeekFlags::FORWARD);

        let mut target: Option<(u64, f64)> = None;
        for (seq, p) in self.iter_seq() {
            if !p.keyframe {
                continue;
            }
            let kf = match p.kf_seek_pts {
                Some(kf) => kf,
                None => continue,
            };

            let better = if forward {
                kf >= pts && target.map_or(true, |(_, best)| kf < best)
            }
            else {
                kf <= pts && target.map_or(true, |(_, best)| kf > best)
            };

            if better {
                target = Some((seq, kf));
            }
        }

        target.map(|(seq, _)| seq)
    }

    /// Assign a seek entry time to the back packet if it is a keyframe still missing one. Used
    /// when a join learns the entry time of the anchor keyframe from the absorbed range.
    pub fn set_tail_kf_seek_pts(&mut self, kf_pts: Ts) {
        if let Some(back) = self.pkts.back_mut() {
            if back.keyframe && back.kf_seek_pts.is_none() {
                back.kf_seek_pts = kf_pts;
            }
        }
    }

    /// Move every packet of `other` onto the tail of this queue, preserving per-packet seek
    /// entry times, and make `other`'s tail statistics and open keyframe block this queue's.
    /// The caller guarantees `other` continues this queue without overlap.
    pub fn concat_from(&mut self, other: &mut Queue) {
        let base = self.end_seq();

        self.keyframe_latest = other.keyframe_latest.map(|seq| base + (seq - other.seq0));
        self.keyframe_pts = other.keyframe_pts;
        self.keyframe_end_pts = other.keyframe_end_pts;

        self.correct_dts &= other.correct_dts;
        self.correct_pos &= other.correct_pos;
        self.last_dts = other.last_dts;
        self.last_pos = other.last_pos;
        self.last_ts = ts_max(self.last_ts, other.last_ts);
        self.seek_end = ts_max(self.seek_end, other.seek_end);

        while let Some(p) = other.pkts.pop_front() {
            self.pkts.push_back(p);
        }
        other.clear();
    }
}
