// Cadenza
// Copyright (c) 2023-2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `demux` module provides the buffering demuxer: the consumer-facing [`Demuxer`] handle over
//! a time-indexed, seekable, concurrency-safe packet cache fed by a [`FormatReader`] producer.
//!
//! A `Demuxer` may run single-threaded, demuxing inline when a consumer asks for packets, or
//! with a dedicated read-ahead worker started by [`Demuxer::start_thread`]. Consumers dequeue
//! packets per track, seek (within the cache when possible), and switch track selection
//! mid-stream; the producer's blocking I/O never runs under the state lock.

mod bridge;
mod queue;
mod range;
mod state;
mod thread;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::info;
use parking_lot::MutexGuard;

use crate::errors::{unsupported_error, Error, Result};
use crate::formats::{
    CheckLevel, ControlResult, Events, FormatControl, FormatReader, SeekFlags, Track,
};
use crate::meta::Tags;
use crate::packet::Packet;
use crate::units::Ts;

use bridge::{ConsumerView, DemuxSink};
use state::{ControlSlot, DemuxState, Shared};

/// `DemuxerOptions` is the set of options the buffering layer reads once at open.
#[derive(Clone)]
pub struct DemuxerOptions {
    /// Minimum seconds buffered ahead of the playback position per eager track before read-ahead
    /// idles. Default: `1.0`.
    pub readahead_secs: f64,
    /// Hard cap on bytes buffered ahead of the reader heads in the current range. Default:
    /// 150 MiB.
    pub max_bytes: usize,
    /// Byte budget for data behind the reader heads, kept for in-cache backward seeks. `0`
    /// disables cache-based back seeks. Default: 50 MiB.
    pub max_back_bytes: usize,
    /// Read-ahead target replacing `readahead_secs` when the source is reached over a network or
    /// through an upstream byte cache. Default: `10.0`.
    pub cache_secs: f64,
    /// Enable the seekable cache: in-cache seeks, range joining, and back-buffer retention.
    /// `None` enables it automatically on seekable sources with a back-buffer budget.
    pub seekable_cache: Option<bool>,
    /// Treat a source that reports itself unseekable as (imprecisely) seekable anyway.
    pub force_seekable: bool,
    /// Permit the producer to follow external references (playlists, cue sheets).
    pub access_references: bool,
    /// Register a companion closed-caption subtitle track for every video track.
    pub sub_create_cc_track: bool,
    /// Cooperative cancellation probe, consulted before every producer read. A true value makes
    /// the producer report end-of-stream.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for DemuxerOptions {
    fn default() -> Self {
        DemuxerOptions {
            readahead_secs: 1.0,
            max_bytes: 150 * 1024 * 1024,
            max_back_bytes: 50 * 1024 * 1024,
            cache_secs: 10.0,
            seekable_cache: None,
            force_seekable: false,
            access_references: true,
            sub_create_cc_track: false,
            cancel: None,
        }
    }
}

/// The result of a non-blocking packet read.
#[derive(Clone, Debug)]
pub enum PacketStatus {
    /// A packet was dequeued.
    Have(Packet),
    /// No packet is available yet; read-ahead was triggered. Poll again after the wakeup
    /// callback fires.
    Pending,
    /// The track ended, is not selected, or is not eagerly read.
    Eof,
}

/// A consumer-visible snapshot of the cache, for pacing and OSD display.
#[derive(Clone, Debug, Default)]
pub struct CacheState {
    /// True while the worker has nothing to do.
    pub idle: bool,
    /// True while a consumer is waiting for a packet that has not arrived.
    pub underrun: bool,
    /// True after the producer reported end-of-stream.
    pub eof: bool,
    /// Estimated bytes buffered across all ranges.
    pub total_bytes: usize,
    /// Estimated bytes buffered ahead of the reader heads.
    pub fw_bytes: usize,
    /// Seconds buffered ahead of the playback position, minimized over eager tracks.
    pub fw_duration: Option<f64>,
    /// The seekable interval of every cached range, least-recently-used first.
    pub ranges: Vec<(Ts, Ts)>,
}

/// The buffering demuxer.
///
/// Created by [`Demuxer::open`] (or [`Demuxer::open_with`] to probe several candidate readers).
/// Runs single-threaded until [`Demuxer::start_thread`] hands the producer to a dedicated
/// read-ahead worker.
pub struct Demuxer {
    shared: Arc<Shared>,
    /// The producer, present while no worker owns it (single-threaded mode).
    reader: Option<Box<dyn FormatReader>>,
    thread: Option<JoinHandle<Box<dyn FormatReader>>>,
    view: ConsumerView,
}

impl Demuxer {
    /// Open a demuxer over the given producer.
    pub fn open(mut reader: Box<dyn FormatReader>, opts: DemuxerOptions) -> Result<Demuxer> {
        let shared = Arc::new(Shared::new(DemuxState::new(&opts)));
        {
            let mut sink = DemuxSink { shared: shared.as_ref() };
            reader.open(&mut sink, CheckLevel::Request)?;
        }
        Ok(Self::finish_open(shared, reader, &opts))
    }

    /// Probe a list of candidate producers, most specific first, and open the first that accepts
    /// the source. Candidates are retried at increasingly permissive check levels, down to
    /// unconditional acceptance.
    pub fn open_with(
        mut candidates: Vec<Box<dyn FormatReader>>,
        opts: DemuxerOptions,
    ) -> Result<Demuxer> {
        for check in
            [CheckLevel::Normal, CheckLevel::Request, CheckLevel::Unsafe, CheckLevel::Force]
        {
            for i in 0..candidates.len() {
                let shared = Arc::new(Shared::new(DemuxState::new(&opts)));
                let accepted = {
                    let mut sink = DemuxSink { shared: shared.as_ref() };
                    candidates[i].open(&mut sink, check).is_ok()
                };
                if accepted {
                    let reader = candidates.remove(i);
                    return Ok(Self::finish_open(shared, reader, &opts));
                }
            }
        }
        unsupported_error("no format reader accepted the source")
    }

    fn finish_open(
        shared: Arc<Shared>,
        reader: Box<dyn FormatReader>,
        opts: &DemuxerOptions,
    ) -> Demuxer {
        let source = reader.source_info();
        {
            let mut state = shared.state.lock();
            state.seekable = source.seekable || opts.force_seekable;
            state.partially_seekable = !source.seekable && opts.force_seekable;
            if state.partially_seekable {
                info!("source is unseekable; forcing partial seekability");
            }
            state.seekable_cache =
                opts.seekable_cache.unwrap_or(state.seekable && opts.max_back_bytes > 0);
            if source.is_network || source.has_upstream_cache {
                state.min_secs = state.min_secs.max(opts.cache_secs);
            }
            state.source = source;
            state.staged.events |= Events::INIT;
        }

        let mut demuxer =
            Demuxer { shared, reader: Some(reader), thread: None, view: ConsumerView::default() };
        demuxer.update();
        demuxer
    }

    /// Hand the producer to a dedicated read-ahead worker thread.
    pub fn start_thread(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let reader = match self.reader.take() {
            Some(reader) => reader,
            None => return Ok(()),
        };

        {
            let mut state = self.shared.state.lock();
            state.threaded = true;
            state.thread_terminate = false;
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("cadenza-demux".to_string())
            .spawn(move || thread::run_loop(shared, reader))
            .map_err(|err| {
                self.shared.state.lock().threaded = false;
                Error::IoError(Box::new(err))
            })?;

        self.thread = Some(handle);
        Ok(())
    }

    /// Stop the read-ahead worker and reclaim the producer for single-threaded use.
    pub fn stop_thread(&mut self) {
        if let Some(handle) = self.thread.take() {
            {
                let mut state = self.shared.state.lock();
                state.thread_terminate = true;
            }
            self.shared.cond.notify_all();

            if let Ok(reader) = handle.join() {
                self.reader = Some(reader);
            }

            let mut state = self.shared.state.lock();
            state.threaded = false;
            state.thread_terminate = false;
        }
    }

    /// Read the next packet for `track`, blocking until one is available or the track ends.
    ///
    /// Returns `None` at end-of-stream (including the soft end-of-stream raised when the forward
    /// buffer is full) and for unselected tracks. Non-eager tracks, such as subtitles playing
    /// alongside video, should be read with [`Demuxer::read_packet_async`] instead: their
    /// packets arrive only as a side effect of demuxing the eager tracks.
    pub fn read_packet(&mut self, track: usize) -> Option<Packet> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();

        loop {
            if track >= state.tracks.len() || !state.tracks[track].selected {
                return None;
            }
            if state.tracks[track].track.attached_picture.is_some() {
                return state.take_attached_picture(track);
            }
            if state.tracks[track].reader_head.is_some() {
                break;
            }
            if state.tracks[track].eof || state.eof {
                return None;
            }

            let wake = !state.reading || !state.underrun;
            state.reading = true;
            state.underrun = true;

            if let Some(reader) = self.reader.as_mut() {
                // Single-threaded: demux inline until the packet shows up.
                if !thread::step(&shared, reader, &mut state) {
                    return None;
                }
                if let Some(wakeup) = state.take_wakeup() {
                    MutexGuard::unlocked(&mut state, || wakeup());
                }
            }
            else {
                if wake {
                    shared.cond.notify_all();
                }
                shared.cond.wait(&mut state);
            }
        }

        let packet = state.dequeue(track);
        drop(state);
        // Draining may unblock read-ahead.
        self.shared.cond.notify_all();
        packet
    }

    /// Read the next packet for `track` without blocking.
    ///
    /// Triggers read-ahead when no packet is buffered. Non-eager tracks report
    /// [`PacketStatus::Eof`] instead of pending, so sparse tracks never stall a caller waiting
    /// for them.
    pub fn read_packet_async(&mut self, track: usize) -> PacketStatus {
        let mut state = self.shared.state.lock();

        if track >= state.tracks.len() || !state.tracks[track].selected {
            return PacketStatus::Eof;
        }
        if state.tracks[track].track.attached_picture.is_some() {
            return match state.take_attached_picture(track) {
                Some(packet) => PacketStatus::Have(packet),
                None => PacketStatus::Eof,
            };
        }
        if state.tracks[track].reader_head.is_some() {
            let packet = state.dequeue(track);
            drop(state);
            self.shared.cond.notify_all();
            return match packet {
                Some(packet) => PacketStatus::Have(packet),
                None => PacketStatus::Eof,
            };
        }
        if state.tracks[track].eof || state.eof || !state.tracks[track].eager {
            return PacketStatus::Eof;
        }

        let wake = !state.reading || !state.underrun;
        state.reading = true;
        state.underrun = true;
        drop(state);
        if wake {
            self.shared.cond.notify_all();
        }
        PacketStatus::Pending
    }

    /// True if a packet for `track` is buffered and ready to dequeue.
    pub fn has_packet(&self, track: usize) -> bool {
        let state = self.shared.state.lock();
        state.tracks.get(track).map_or(false, |t| t.reader_head.is_some())
    }

    /// Read the next packet of any selected track, in demux order. Single-threaded mode only.
    pub fn read_any_packet(&mut self) -> Option<Packet> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();

        loop {
            let ready = state.tracks.iter().position(|t| {
                t.selected
                    && (t.reader_head.is_some()
                        || (t.track.attached_picture.is_some() && !t.attached_picture_added))
            });

            if let Some(track) = ready {
                let packet = if state.tracks[track].track.attached_picture.is_some() {
                    state.take_attached_picture(track)
                }
                else {
                    state.dequeue(track)
                };
                drop(state);
                self.shared.cond.notify_all();
                return packet;
            }

            if state.eof {
                return None;
            }

            state.reading = true;
            state.underrun = true;

            match self.reader.as_mut() {
                Some(reader) => {
                    if !thread::step(&shared, reader, &mut state) {
                        return None;
                    }
                    if let Some(wakeup) = state.take_wakeup() {
                        MutexGuard::unlocked(&mut state, || wakeup());
                    }
                }
                // With a worker running, use the per-track read calls instead.
                None => return None,
            }
        }
    }

    /// Drop all buffered packets. Reader positions and end-of-stream flags reset; the producer's
    /// position is untouched. Idempotent.
    pub fn flush(&mut self) {
        let mut state = self.shared.state.lock();
        state.flush();
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Seek to `pts` seconds (or a position factor with [`SeekFlags::FACTOR`]).
    ///
    /// Satisfied from the cache when a cached range contains the target; otherwise the cache
    /// starts a fresh range and the producer is repositioned. Returns false, with no state
    /// change, if the source cannot seek.
    pub fn seek(&mut self, pts: f64, flags: SeekFlags) -> bool {
        let ok = {
            let mut state = self.shared.state.lock();
            state.seek(pts, flags, true)
        };
        if ok {
            self.shared.cond.notify_all();
            self.drive_pending();
        }
        ok
    }

    /// Select or deselect a track. `ref_pts` is the playback position the selection applies to;
    /// enabling a track mid-stream triggers a refresh seek that re-collects packets for it
    /// without disturbing the established queues beyond de-duplication.
    pub fn select_track(&mut self, track: usize, selected: bool, ref_pts: Ts) {
        {
            let mut state = self.shared.state.lock();
            if track >= state.tracks.len() {
                return;
            }
            state.select_track(track, selected, ref_pts);
        }
        self.shared.cond.notify_all();
        self.drive_pending();
    }

    /// Set the offset added to every timestamp handed to consumers.
    pub fn set_ts_offset(&mut self, offset: f64) {
        self.shared.state.lock().ts_offset = offset;
    }

    /// Forward a control query to the producer. The worker executes it with the state lock
    /// dropped; the calling thread blocks until the result is in.
    pub fn control(&mut self, ctrl: FormatControl) -> ControlResult {
        if let Some(reader) = self.reader.as_mut() {
            return reader.control(ctrl);
        }

        let mut state = self.shared.state.lock();
        state.control = ControlSlot::Pending(ctrl);
        self.shared.cond.notify_all();

        loop {
            if let ControlSlot::Done(result) = state.control {
                state.control = ControlSlot::Idle;
                return result;
            }
            self.shared.cond.wait(&mut state);
        }
    }

    /// Pull the staged producer-side changes into this consumer view. Returns the coalesced
    /// change notifications since the previous update.
    pub fn update(&mut self) -> Events {
        let mut state = self.shared.state.lock();
        state.apply_update(&mut self.view)
    }

    /// Install the callback fired when a packet arrives after an underrun or the stream ends.
    pub fn set_wakeup(&mut self, wakeup: impl Fn() + Send + Sync + 'static) {
        self.shared.state.lock().wakeup = Some(Arc::new(wakeup));
    }

    /// The number of registered tracks, as of the last [`Demuxer::update`].
    pub fn num_tracks(&self) -> usize {
        self.view.tracks.len()
    }

    /// All registered tracks, as of the last [`Demuxer::update`].
    pub fn tracks(&self) -> &[Track] {
        &self.view.tracks
    }

    /// One track descriptor, as of the last [`Demuxer::update`].
    pub fn track(&self, track: usize) -> Option<&Track> {
        self.view.tracks.get(track)
    }

    /// The container-level metadata, as of the last [`Demuxer::update`].
    pub fn metadata(&self) -> &Tags {
        &self.view.metadata
    }

    /// The media duration in seconds, if known.
    pub fn duration(&self) -> Ts {
        self.view.duration
    }

    /// The media start time in seconds, if known.
    pub fn start_time(&self) -> Ts {
        self.view.start_time
    }

    /// True if seeking is possible at all.
    pub fn seekable(&self) -> bool {
        self.shared.state.lock().seekable
    }

    /// True if seekability was forced on an unseekable source.
    pub fn partially_seekable(&self) -> bool {
        self.shared.state.lock().partially_seekable
    }

    /// The high-water mark of dequeued packet byte positions.
    pub fn filepos(&self) -> Option<u64> {
        self.shared.state.lock().filepos
    }

    /// The bitrate of `track`, in bits per second: the producer's own figure when it answers the
    /// bitrate control, the windowed estimate from dequeued packets otherwise.
    pub fn track_bitrate(&mut self, track: usize) -> Option<f64> {
        if let ControlResult::Bitrate(bitrate) = self.control(FormatControl::Bitrate) {
            return Some(bitrate);
        }
        let state = self.shared.state.lock();
        state.tracks.get(track).and_then(|t| t.bitrate)
    }

    /// True if `track` currently reports end-of-stream to consumers.
    pub fn track_eof(&self, track: usize) -> bool {
        let state = self.shared.state.lock();
        state.tracks.get(track).map_or(true, |t| t.eof)
    }

    /// A snapshot of the cache state.
    pub fn cache_state(&self) -> CacheState {
        self.shared.state.lock().cache_state()
    }

    /// Run queued seeks and selection follow-ups inline when no worker owns the producer.
    fn drive_pending(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        while state.seeking.is_some() || state.tracks_switched {
            let reader = match self.reader.as_mut() {
                Some(reader) => reader,
                None => break,
            };
            if !thread::step(&shared, reader, &mut state) {
                break;
            }
            if let Some(wakeup) = state.take_wakeup() {
                MutexGuard::unlocked(&mut state, || wakeup());
            }
        }
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        self.stop_thread();
        // Producer close hook, then queue teardown.
        self.reader = None;
        let mut state = self.shared.state.lock();
        state.flush();
    }
}
