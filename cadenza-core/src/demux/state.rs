// Cadenza
// Copyright (c) 2023-2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `state` module holds the shared mutable state of the demuxer: per-track reader state, the
//! packet cache, selection, and the requests pending for the worker.
//!
//! One `parking_lot` mutex and one condition variable protect everything here. The worker drops
//! the lock strictly around producer I/O; every other mutation is short pointer-and-counter
//! surgery under the lock.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::formats::{
    CodecParameters, ControlResult, Events, FormatControl, SeekFlags, SourceInfo, Track, TrackType,
};
use crate::packet::Packet;
use crate::units::{ts_min, Ts, BITRATE_WINDOW};

use super::bridge::StagedChanges;
use super::range::{PacketCache, TrackView};
use super::{CacheState, DemuxerOptions};

/// The single lock and condition variable shared by the consumer handle, the producer sink, and
/// the worker thread.
pub(crate) struct Shared {
    pub state: Mutex<DemuxState>,
    pub cond: Condvar,
}

impl Shared {
    pub fn new(state: DemuxState) -> Shared {
        Shared { state: Mutex::new(state), cond: Condvar::new() }
    }
}

/// A low-level seek queued for the worker. A pending seek supersedes queued reads: packets
/// arriving while one is queued are dropped.
#[derive(Copy, Clone, Debug)]
pub(crate) struct PendingSeek {
    pub pts: f64,
    pub flags: SeekFlags,
}

/// A control query in flight between a consumer and the worker.
#[derive(Copy, Clone)]
pub(crate) enum ControlSlot {
    Idle,
    Pending(FormatControl),
    Done(ControlResult),
}

/// Per-track demuxer state: the descriptor plus selection, reader, and statistics state.
pub(crate) struct TrackState {
    pub track: Track,
    /// True if a consumer wants this track's packets.
    pub selected: bool,
    /// True if this track paces read-ahead and end-of-stream. Derived from selection; see
    /// [`DemuxState::update_eager`].
    pub eager: bool,
    /// True while packets are being dropped to re-synchronize after a refresh seek.
    pub refreshing: bool,
    /// True if the track was enabled mid-stream and still needs a refresh seek.
    pub need_refresh: bool,
    /// End-of-stream flag visible to consumers. Set on producer EOF and as a soft back-pressure
    /// signal when the forward buffer is full; cleared by new packets.
    pub eof: bool,
    /// Sequence of the next packet to hand to the consumer, in the current range's queue.
    pub reader_head: Option<u64>,
    /// True if the reader head should latch onto the next appended keyframe.
    pub skip_to_keyframe: bool,
    /// True once the attached picture was emitted.
    pub attached_picture_added: bool,
    /// Approximate playback position: the timestamp of the last dequeued packet.
    pub base_ts: Ts,

    /// Most recent bitrate estimate in bits per second.
    pub bitrate: Option<f64>,
    br_bytes: usize,
    br_start_ts: Ts,
}

impl TrackState {
    fn new(track: Track) -> TrackState {
        TrackState {
            track,
            selected: false,
            eager: false,
            refreshing: false,
            need_refresh: false,
            eof: false,
            reader_head: None,
            skip_to_keyframe: false,
            attached_picture_added: false,
            base_ts: None,
            bitrate: None,
            br_bytes: 0,
            br_start_ts: None,
        }
    }

    fn clear_reader_state(&mut self) {
        self.reader_head = None;
        self.skip_to_keyframe = false;
        self.eof = false;
        self.refreshing = false;
        self.base_ts = None;
        self.bitrate = None;
        self.br_bytes = 0;
        self.br_start_ts = None;
    }
}

/// All shared mutable demuxer state, protected by [`Shared::state`].
pub(crate) struct DemuxState {
    // Configuration, read once at open.
    pub min_secs: f64,
    pub max_bytes: usize,
    pub max_back_bytes: usize,
    pub seekable_cache: bool,
    pub sub_create_cc_track: bool,
    pub access_references: bool,
    pub cancel: Option<Arc<AtomicBool>>,

    // Source facts.
    pub source: SourceInfo,
    /// True if seeking is allowed at all (source seekable, or forced).
    pub seekable: bool,
    /// True if seeking was forced on an unseekable source; seeks may be imprecise.
    pub partially_seekable: bool,

    pub tracks: Vec<TrackState>,
    pub cache: PacketCache,

    // Worker state and requests.
    pub threaded: bool,
    pub thread_terminate: bool,
    /// True once a consumer has requested packets; read-ahead runs only while set.
    pub reading: bool,
    /// True while the worker has nothing to do.
    pub idle: bool,
    /// True after the producer reported end-of-stream. Cleared by seeks and new packets.
    pub eof: bool,
    /// True until the first fill or seek; a selection before that point needs no refresh.
    pub initial_state: bool,
    pub seeking: Option<PendingSeek>,
    pub tracks_switched: bool,
    /// Earliest reference time passed to `select_track` since the last refresh computation.
    pub refresh_ref_pts: Ts,
    pub control: ControlSlot,

    /// True while a consumer found no packet and is waiting; the next appended packet fires the
    /// wakeup callback.
    pub underrun: bool,
    warned_overflow: bool,
    overflow_soft_eof: bool,

    /// Offset added to every timestamp handed to consumers.
    pub ts_offset: f64,
    /// High-water mark of dequeued packet byte positions.
    pub filepos: Option<u64>,

    pub staged: StagedChanges,
    pub wakeup: Option<Arc<dyn Fn() + Send + Sync>>,
    wakeup_pending: bool,
}

impl DemuxState {
    pub fn new(opts: &DemuxerOptions) -> DemuxState {
        DemuxState {
            min_secs: opts.readahead_secs,
            max_bytes: opts.max_bytes,
            max_back_bytes: opts.max_back_bytes,
            seekable_cache: false,
            sub_create_cc_track: opts.sub_create_cc_track,
            access_references: opts.access_references,
            cancel: opts.cancel.clone(),
            source: SourceInfo::default(),
            seekable: false,
            partially_seekable: false,
            tracks: Vec::new(),
            cache: PacketCache::new(0),
            threaded: false,
            thread_terminate: false,
            reading: false,
            idle: true,
            eof: false,
            initial_state: true,
            seeking: None,
            tracks_switched: false,
            refresh_ref_pts: None,
            control: ControlSlot::Idle,
            underrun: false,
            warned_overflow: false,
            overflow_soft_eof: false,
            ts_offset: 0.0,
            filepos: None,
            staged: StagedChanges::default(),
            wakeup: None,
            wakeup_pending: false,
        }
    }

    fn track_flags(&self) -> (Vec<bool>, Vec<bool>, Vec<Option<u64>>) {
        let selected = self.tracks.iter().map(|t| t.selected).collect();
        let eager = self.tracks.iter().map(|t| t.eager).collect();
        let heads = self.tracks.iter().map(|t| t.reader_head).collect();
        (selected, eager, heads)
    }

    /// Schedule the wakeup callback to fire once the lock is released.
    pub fn request_wakeup(&mut self) {
        if self.wakeup.is_some() {
            self.wakeup_pending = true;
        }
    }

    /// Take the wakeup callback if a fire is pending. The caller invokes it without the lock.
    pub fn take_wakeup(&mut self) -> Option<Arc<dyn Fn() + Send + Sync>> {
        if self.wakeup_pending {
            self.wakeup_pending = false;
            self.wakeup.clone()
        }
        else {
            None
        }
    }

    /// Recompute the derived `eager` flag for every track. A selected track is eager unless it
    /// only carries an attached picture; subtitle tracks are eager only when no other track type
    /// is, so their sparse packets never stall read-ahead.
    pub fn update_eager(&mut self) {
        let mut av_eager = false;
        for t in &mut self.tracks {
            t.eager = t.selected && t.track.attached_picture.is_none();
            if t.eager && t.track.track_type != TrackType::Subtitle {
                av_eager = true;
            }
        }
        if av_eager {
            for t in &mut self.tracks {
                if t.track.track_type == TrackType::Subtitle {
                    t.eager = false;
                }
            }
        }
    }

    /// Register a new track. When closed-caption track creation is enabled, a video track brings
    /// a companion CC subtitle track with it.
    pub fn add_track(&mut self, mut track: Track) -> usize {
        let make_cc = self.sub_create_cc_track && track.track_type == TrackType::Video;
        let cc_id = track.id;

        let index = self.tracks.len();
        track.index = index;
        debug!("registered track {} (type {:?}, id {})", index, track.track_type, track.id);
        self.tracks.push(TrackState::new(track));
        self.cache.add_track();
        self.staged.events |= Events::STREAMS;

        if make_cc {
            let mut cc = Track::new(cc_id, TrackType::Subtitle)
                .with_codec_params(CodecParameters::new().for_codec("eia_608"));
            cc.index = self.tracks.len();
            self.tracks.push(TrackState::new(cc));
            self.cache.add_track();
        }

        self.update_eager();
        index
    }

    /// Append one packet from the producer. Returns true if state observable by a blocked
    /// consumer changed.
    pub fn add_packet(&mut self, mut p: Packet) -> bool {
        let idx = p.track;
        if idx >= self.tracks.len() {
            warn!("dropping packet for unknown track {}", idx);
            return false;
        }

        // A queued seek supersedes any reads still in flight.
        if self.seeking.is_some() {
            return false;
        }

        let t = &mut self.tracks[idx];
        if !t.selected {
            return false;
        }

        if t.refreshing {
            // Drop packets until the producer passes the position it was rewound from.
            let q = &self.cache.current().queues[idx];
            let passed = if q.correct_dts {
                match (p.dts, q.last_dts) {
                    (Some(dts), Some(last)) => dts > last,
                    _ => false,
                }
            }
            else if q.correct_pos {
                match (p.pos, q.last_pos) {
                    (Some(pos), Some(last)) => pos > last,
                    _ => false,
                }
            }
            else {
                // The queue lost monotonicity mid-refresh; accept the glitch.
                true
            };
            if !passed {
                return false;
            }
            self.tracks[idx].refreshing = false;
        }

        // Substitute a missing PTS for non-video tracks so consumers always see one.
        if self.tracks[idx].track.track_type != TrackType::Video && p.pts.is_none() {
            p.pts = p.dts;
        }

        let keyframe = p.keyframe;
        let out = self.cache.current_mut().queues[idx].append(p);
        self.cache.total_bytes += out.size;

        let back_seq = self.cache.current().queues[idx].back_seq();
        let t = &mut self.tracks[idx];
        if t.reader_head.is_none() && (!t.skip_to_keyframe || keyframe) {
            t.reader_head = back_seq;
            t.skip_to_keyframe = false;
        }
        if t.reader_head.is_some() {
            self.cache.fw_bytes += out.size;
        }
        t.eof = false;
        self.eof = false;
        self.idle = false;

        if out.range_changed {
            let (selected, eager, heads) = self.track_flags();
            let tv = TrackView { selected: &selected, eager: &eager, heads: &heads };
            self.cache.current_mut().update_seek_ranges(&selected);

            if self.seekable_cache {
                if let Some(resume) = self.cache.try_join(&tv) {
                    // Resume low-level demuxing past the join point, de-duplicating on the way.
                    self.start_refresh_tracks();
                    self.seeking = Some(PendingSeek { pts: resume, flags: SeekFlags::HR });
                }
                self.cache.recompute_fw_bytes(&tv);
            }
        }

        if self.underrun {
            self.underrun = false;
            self.request_wakeup();
        }

        self.debug_check();
        true
    }

    /// Mark every refreshable track for packet de-duplication after a rewind: all selected tracks
    /// with buffered data whose recorded position the incoming packets can be compared against.
    pub fn start_refresh_tracks(&mut self) {
        for (i, t) in self.tracks.iter_mut().enumerate() {
            if t.selected && !self.cache.current().queues[i].is_empty() {
                t.refreshing = true;
            }
        }
    }

    /// The producer reported end-of-stream (or was cancelled): close open keyframe blocks,
    /// refresh range aggregates, and raise every track's EOF flag.
    pub fn mark_eof(&mut self) {
        let (selected, eager, heads) = self.track_flags();
        let tv = TrackView { selected: &selected, eager: &eager, heads: &heads };

        let mut changed = false;
        for q in &mut self.cache.current_mut().queues {
            changed |= q.close_block();
        }
        if changed {
            self.cache.current_mut().update_seek_ranges(&selected);
            if self.seekable_cache {
                if let Some(resume) = self.cache.try_join(&tv) {
                    self.start_refresh_tracks();
                    self.seeking = Some(PendingSeek { pts: resume, flags: SeekFlags::HR });
                }
                self.cache.recompute_fw_bytes(&tv);
            }
        }

        for t in &mut self.tracks {
            t.eof = true;
        }

        if !self.eof {
            self.eof = true;
            self.request_wakeup();
        }
        self.idle = true;

        self.debug_check();
    }

    /// Emit the attached picture for `idx` if it has one and it was not emitted yet.
    pub fn take_attached_picture(&mut self, idx: usize) -> Option<Packet> {
        let ts_offset = self.ts_offset;
        let t = &mut self.tracks[idx];
        match &t.track.attached_picture {
            Some(pic) if !t.attached_picture_added => {
                t.attached_picture_added = true;
                Some(pic.offset_by(ts_offset))
            }
            _ => None,
        }
    }

    /// Hand the packet at the reader head to the consumer, advance the head, update statistics,
    /// and enforce the back-buffer budget.
    pub fn dequeue(&mut self, idx: usize) -> Option<Packet> {
        let head = self.tracks[idx].reader_head?;
        let q = &self.cache.current().queues[idx];
        let p = q.get(head)?.clone();
        let next = q.next_seq(head);
        let size = p.estimated_size();

        let t = &mut self.tracks[idx];
        t.reader_head = next;
        self.cache.fw_bytes -= size;

        if let Some(ts) = p.ts() {
            t.base_ts = Some(ts);
        }

        // Byte position high-water mark for the consumer.
        if let Some(pos) = p.pos {
            if self.filepos.map_or(true, |f| pos > f) {
                self.filepos = Some(pos);
            }
        }

        // Bitrate estimation: measure whole keyframe blocks over at least the minimum window,
        // using packet timestamps rather than wall clock.
        t.br_bytes += size;
        if p.keyframe {
            match (t.br_start_ts, p.ts()) {
                (Some(start), Some(ts)) => {
                    let dt = ts - start;
                    if dt >= BITRATE_WINDOW {
                        t.bitrate = Some(t.br_bytes as f64 * 8.0 / dt);
                        t.br_start_ts = Some(ts);
                        t.br_bytes = 0;
                    }
                    else if dt < 0.0 {
                        // Timestamps went backwards (seek or reset); restart the window.
                        t.br_start_ts = Some(ts);
                        t.br_bytes = 0;
                    }
                }
                (None, Some(ts)) => {
                    t.br_start_ts = Some(ts);
                    t.br_bytes = 0;
                }
                _ => (),
            }
        }

        let max_back = if self.seekable_cache { self.max_back_bytes } else { 0 };
        let (selected, eager, heads) = self.track_flags();
        let tv = TrackView { selected: &selected, eager: &eager, heads: &heads };
        self.cache.prune(max_back, &tv);

        // Draining below the forward cap lifts the soft back-pressure EOF.
        if self.overflow_soft_eof && self.cache.fw_bytes < self.max_bytes {
            self.overflow_soft_eof = false;
            if !self.eof {
                for t in &mut self.tracks {
                    t.eof = false;
                }
            }
        }

        self.debug_check();
        Some(p.offset_by(self.ts_offset))
    }

    /// Decide whether the worker should demux more data right now.
    ///
    /// Read-ahead runs once a consumer has requested packets, and continues until every eager
    /// track has at least `min_secs` of data buffered past its playback position, the forward
    /// byte budget is exhausted, or the producer reports end-of-stream.
    pub fn want_read(&mut self) -> bool {
        if self.eof || !self.reading {
            return false;
        }

        if self.cache.fw_bytes >= self.max_bytes {
            self.handle_overflow();
            return false;
        }

        for (i, t) in self.tracks.iter().enumerate() {
            if !t.eager {
                continue;
            }
            if t.reader_head.is_none() {
                return true;
            }
            let q = &self.cache.current().queues[i];
            let base = t.base_ts.or_else(|| t.reader_head.and_then(|h| q.get(h)).and_then(|p| p.ts()));
            match (q.last_ts, base) {
                (Some(last), Some(base)) => {
                    if last - base < self.min_secs {
                        return true;
                    }
                }
                // Without usable timing, keep reading; the byte budget bounds us.
                _ => return true,
            }
        }

        false
    }

    /// The forward buffer is full but consumers still starve: warn once, pause read-ahead, and
    /// raise a soft EOF on every selected track so consumers do not block indefinitely.
    fn handle_overflow(&mut self) {
        if !self.warned_overflow {
            let over: Vec<String> = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.eager)
                .map(|(i, _)| format!("#{}", i))
                .collect();
            warn!(
                "demuxer forward buffer full ({} / {} bytes); affected tracks: {}",
                self.cache.fw_bytes,
                self.max_bytes,
                over.join(", ")
            );
            self.warned_overflow = true;
        }

        if !self.overflow_soft_eof {
            self.overflow_soft_eof = true;
            for t in &mut self.tracks {
                if t.selected {
                    t.eof = true;
                }
            }
            self.request_wakeup();
        }
    }

    /// Clear every track's reader state and the global read/EOF flags, in preparation for a seek.
    pub fn clear_reader_state(&mut self) {
        for t in &mut self.tracks {
            t.clear_reader_state();
            t.need_refresh = false;
        }
        self.refresh_ref_pts = None;
        self.cache.fw_bytes = 0;
        self.reading = false;
        self.underrun = false;
        self.eof = false;
        self.overflow_soft_eof = false;
        self.idle = true;
    }

    /// Try to satisfy a seek from the cache. Returns true if the reader heads were repositioned.
    fn seek_cache(&mut self, pts: f64, flags: SeekFlags) -> bool {
        let (selected, ..) = self.track_flags();

        let r_idx = match self.cache.find_cached_range(pts) {
            Some(r_idx) => r_idx,
            None => return false,
        };

        let switching = r_idx + 1 != self.cache.ranges.len();
        if switching {
            self.cache.promote(r_idx, &selected);
        }

        // Unless the caller lands precisely anyway, adopt the video track's keyframe entry time
        // as the target for every other track so audio does not overshoot the video keyframe.
        let mut eff_pts = pts;
        if !flags.contains(SeekFlags::HR) {
            let video = self
                .tracks
                .iter()
                .position(|t| t.selected && t.track.track_type == TrackType::Video && t.eager);
            if let Some(vi) = video {
                let q = &self.cache.current().queues[vi];
                if let Some(seq) = q.find_seek_target(pts, flags) {
                    if let Some(kf) = q.get(seq).and_then(|p| p.kf_seek_pts()) {
                        eff_pts = kf;
                    }
                }
            }
        }

        for (i, t) in self.tracks.iter_mut().enumerate() {
            if !t.selected {
                continue;
            }
            let q = &self.cache.current().queues[i];
            match q.find_seek_target(eff_pts, flags) {
                Some(seq) => {
                    t.reader_head = Some(seq);
                    t.skip_to_keyframe = false;
                }
                None => {
                    t.reader_head = None;
                    t.skip_to_keyframe = true;
                }
            }
            t.eof = false;
            t.base_ts = Some(eff_pts);
        }

        let (selected, eager, heads) = self.track_flags();
        let tv = TrackView { selected: &selected, eager: &eager, heads: &heads };
        self.cache.recompute_fw_bytes(&tv);

        if switching {
            // The producer's position belongs to the old range. Resume low-level demuxing at the
            // end of the newly current range, de-duplicating overlap on the way.
            self.eof = false;
            self.start_refresh_tracks();
            if let Some(end) = self.cache.current().seek_end {
                self.seeking = Some(PendingSeek { pts: end - 1.0, flags: SeekFlags::HR });
            }
        }

        debug!("seek to {} satisfied from cache (effective target {})", pts, eff_pts);
        self.debug_check();
        true
    }

    /// Execute a seek request: try the cache first, otherwise start a fresh range and queue a
    /// low-level seek. `from_user` applies the timestamp offset.
    ///
    /// Returns false, with no state change, when the source cannot seek.
    pub fn seek(&mut self, pts: f64, flags: SeekFlags, from_user: bool) -> bool {
        if !self.seekable {
            warn!("cannot seek: source is not seekable");
            return false;
        }
        if self.partially_seekable {
            warn!("source is only partially seekable; seek may be inaccurate");
        }

        let mut pts = pts;
        if from_user && !flags.contains(SeekFlags::FACTOR) {
            pts -= self.ts_offset;
        }

        self.clear_reader_state();
        self.seeking = None;

        if !flags.contains(SeekFlags::FACTOR) && self.seekable_cache && self.seek_cache(pts, flags)
        {
            return true;
        }

        let (selected, ..) = self.track_flags();
        if self.seekable_cache {
            self.cache.push_new_current(&selected);
        }
        else {
            self.cache.clear();
        }

        self.seeking = Some(PendingSeek { pts, flags });
        self.debug_check();
        true
    }

    /// Flip one track's selection and prepare the refresh bookkeeping. No-op if the selection
    /// does not change.
    pub fn select_track(&mut self, idx: usize, selected: bool, ref_pts: Ts) {
        let t = &mut self.tracks[idx];
        if t.selected == selected {
            return;
        }

        t.selected = selected;
        t.clear_reader_state();

        if selected {
            if !self.initial_state {
                t.need_refresh = true;
                self.refresh_ref_pts = ts_min(self.refresh_ref_pts, ref_pts);
            }
        }
        else {
            // Packets buffered for a deselected track would only go stale.
            for range in &mut self.cache.ranges {
                let q = &mut range.queues[idx];
                let bytes: usize = q.iter_seq().map(|(_, p)| p.estimated_size()).sum();
                self.cache.total_bytes -= bytes;
                q.clear();
            }
        }

        self.update_eager();

        let (selected_flags, eager, heads) = self.track_flags();
        let tv = TrackView { selected: &selected_flags, eager: &eager, heads: &heads };
        for range in &mut self.cache.ranges {
            range.update_seek_ranges(&selected_flags);
        }
        self.cache.drop_dead_ranges(&selected_flags);
        self.cache.recompute_fw_bytes(&tv);

        self.tracks_switched = true;
        self.debug_check();
    }

    /// Worker-side follow-up to a selection change: compute and queue the refresh seek for
    /// tracks enabled mid-stream.
    pub fn initiate_refresh(&mut self) {
        let needs: Vec<bool> = self.tracks.iter().map(|t| t.need_refresh).collect();
        for t in &mut self.tracks {
            t.need_refresh = false;
        }
        if !needs.iter().any(|&n| n) || self.initial_state {
            self.refresh_ref_pts = None;
            return;
        }

        // The refresh target: the earliest of the caller's reference time and every selected
        // audio/video track's playback position.
        let mut target = self.refresh_ref_pts.take();
        for t in &self.tracks {
            if t.selected && t.track.track_type != TrackType::Subtitle {
                target = ts_min(target, t.base_ts);
            }
        }
        let target = match target {
            Some(target) => target,
            None => {
                debug!("no reference position for refresh seek");
                return;
            }
        };

        // If nothing but the newly enabled tracks is selected there is nothing to preserve:
        // perform a normal seek.
        let only_new =
            self.tracks.iter().enumerate().all(|(i, t)| !t.selected || needs[i]);
        if only_new {
            self.seek(target, SeekFlags::empty(), false);
            return;
        }

        // De-duplication after the rewind needs a monotone DTS or position on every established
        // queue; without one, skip the refresh and accept a stutter over a corrupted queue.
        for (i, t) in self.tracks.iter().enumerate() {
            if !t.selected || needs[i] {
                continue;
            }
            let q = &self.cache.current().queues[i];
            if !q.is_empty() && !q.correct_dts && !q.correct_pos {
                warn!("refresh seek impossible: track {} has no monotone dts or position", i);
                return;
            }
        }

        self.start_refresh_tracks();
        self.seeking = Some(PendingSeek { pts: target - 1.0, flags: SeekFlags::HR });
        debug!("refresh seek to {}", target - 1.0);
    }

    /// Drop all buffered packets and reset reader and EOF state. Idempotent.
    pub fn flush(&mut self) {
        self.cache.clear();
        for t in &mut self.tracks {
            t.reader_head = None;
            t.skip_to_keyframe = false;
            t.eof = false;
            t.refreshing = false;
        }
        self.eof = false;
        self.overflow_soft_eof = false;
        debug_assert!(self.cache.total_bytes == 0);
        self.debug_check();
    }

    /// A consumer-visible snapshot of the cache state.
    pub fn cache_state(&self) -> CacheState {
        let mut fw_duration: Ts = None;
        for (i, t) in self.tracks.iter().enumerate() {
            if !t.eager {
                continue;
            }
            let q = &self.cache.current().queues[i];
            let base = t.base_ts.or_else(|| t.reader_head.and_then(|h| q.get(h)).and_then(|p| p.ts()));
            let buffered = match (q.last_ts, base) {
                (Some(last), Some(base)) => Some((last - base).max(0.0)),
                _ => None,
            };
            fw_duration = match (fw_duration, buffered) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (None, b) => b,
                (a, None) => a,
            };
        }

        CacheState {
            idle: self.idle,
            underrun: self.underrun,
            eof: self.eof,
            total_bytes: self.cache.total_bytes,
            fw_bytes: self.cache.fw_bytes,
            fw_duration,
            ranges: self
                .cache
                .ranges
                .iter()
                .map(|r| {
                    (
                        r.seek_start.map(|ts| ts + self.ts_offset),
                        r.seek_end.map(|ts| ts + self.ts_offset),
                    )
                })
                .collect(),
        }
    }

    /// Verify the invariants that must hold between operations. Debug builds only.
    pub fn debug_check(&self) {
        #[cfg(debug_assertions)]
        {
            assert_eq!(self.cache.num_tracks(), self.tracks.len());
            let (selected, eager, heads) = self.track_flags();
            let tv = TrackView { selected: &selected, eager: &eager, heads: &heads };
            self.cache.debug_check(&tv);
        }
    }
}
