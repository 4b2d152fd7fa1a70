// Cadenza
// Copyright (c) 2023-2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `packet` module defines the packet structure.

use std::sync::Arc;

use crate::units::{ts_clamp, Ts};

/// Fixed per-packet bookkeeping overhead, in bytes, included in cache size estimates.
const PACKET_OVERHEAD: usize = 64;

/// A `Packet` contains a discrete amount of demuxed data for a single elementary stream. The
/// payload is opaque to the buffering layer; only the timing and framing metadata is interpreted.
///
/// # Timing
///
/// * **Presentation Timestamp (PTS):** The time, in seconds, the decoded packet should be
///   presented. `None` if the container did not signal it.
///
/// * **Decode Timestamp (DTS):** The time, in seconds, the packet should be decoded. For streams
///   with bidirectional prediction the DTS may lag the PTS.
///
/// * **Segment bounds:** When `segmented` is set, `start` and `end` bound the portion of the
///   packet that belongs to the current timeline segment. Timestamps folded into seek ranges are
///   clamped to these bounds.
///
/// A packet is immutable once enqueued. The payload is reference counted: the copy handed to a
/// consumer on dequeue shares the payload with the cached original, which remains available for
/// re-reads after an in-cache seek.
#[derive(Clone, Debug)]
pub struct Packet {
    /// The index of the track this packet belongs to.
    pub track: usize,
    /// The presentation timestamp (PTS) of the packet in seconds.
    pub pts: Ts,
    /// The decode timestamp (DTS) of the packet in seconds.
    pub dts: Ts,
    /// The byte position of the packet in the source.
    pub pos: Option<u64>,
    /// True if the packet starts a keyframe block.
    pub keyframe: bool,
    /// True if the packet carries timeline segment bounds.
    pub segmented: bool,
    /// The segment start time in seconds, when `segmented` is set.
    pub start: Ts,
    /// The segment end time in seconds, when `segmented` is set.
    pub end: Ts,
    /// The packet payload.
    pub data: Arc<[u8]>,
    /// The earliest presentation time reachable by decoding from this keyframe. Assigned by the
    /// queue when the next keyframe (or EOF) closes the block this packet opened.
    pub(crate) kf_seek_pts: Ts,
}

impl Packet {
    /// Create a new `Packet` with the given timing information.
    pub fn new(track: usize, pts: Ts, dts: Ts, data: impl Into<Arc<[u8]>>) -> Self {
        Packet {
            track,
            pts,
            dts,
            pos: None,
            keyframe: false,
            segmented: false,
            start: None,
            end: None,
            data: data.into(),
            kf_seek_pts: None,
        }
    }

    /// Provide the byte position of the packet in the source.
    pub fn with_pos(mut self, pos: u64) -> Self {
        self.pos = Some(pos);
        self
    }

    /// Mark the packet as a keyframe.
    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    /// Provide timeline segment bounds and mark the packet as segmented.
    pub fn with_segment(mut self, start: Ts, end: Ts) -> Self {
        self.segmented = true;
        self.start = start;
        self.end = end;
        self
    }

    /// The effective timestamp of the packet: the PTS, or the DTS when the PTS is unknown.
    #[inline]
    pub fn ts(&self) -> Ts {
        self.pts.or(self.dts)
    }

    /// The effective timestamp constrained to the packet's segment bounds, used for seek range
    /// accounting.
    #[inline]
    pub(crate) fn seek_ts(&self) -> Ts {
        let ts = self.ts();
        if self.segmented {
            ts_clamp(ts, self.start, self.end)
        }
        else {
            ts
        }
    }

    /// The earliest presentation time reachable by decoding from this packet, if this packet is a
    /// keyframe whose block has been closed.
    #[inline]
    pub fn kf_seek_pts(&self) -> Ts {
        self.kf_seek_pts
    }

    /// An estimate of the total in-memory size of the packet, in bytes, used for cache budget
    /// accounting.
    #[inline]
    pub fn estimated_size(&self) -> usize {
        self.data.len() + PACKET_OVERHEAD
    }

    /// Get an immutable slice of the packet payload.
    #[inline]
    pub fn buf(&self) -> &[u8] {
        &self.data
    }

    /// Returns a copy of the packet with `offset` seconds added to every known timestamp. Used to
    /// apply the user-visible timestamp offset on dequeue.
    pub(crate) fn offset_by(&self, offset: f64) -> Packet {
        let mut p = self.clone();
        if offset != 0.0 {
            p.pts = p.pts.map(|ts| ts + offset);
            p.dts = p.dts.map(|ts| ts + offset);
            p.start = p.start.map(|ts| ts + offset);
            p.end = p.end.map(|ts| ts + offset);
        }
        p
    }
}
