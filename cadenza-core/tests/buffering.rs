// Cadenza
// Copyright (c) 2023-2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of the buffering demuxer over a scripted producer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cadenza_core::demux::{Demuxer, DemuxerOptions, PacketStatus};
use cadenza_core::errors::{unsupported_error, Result};
use cadenza_core::formats::{
    CheckLevel, CodecParameters, ControlResult, Events, FormatControl, FormatReader, FormatSink,
    SeekFlags, SourceInfo, Track, TrackType,
};
use cadenza_core::meta::{Tag, Tags};
use cadenza_core::packet::Packet;

/// A scripted producer: a fixed timeline of packets emitted a few per fill, with seeks landing
/// on the last track-0 keyframe at or before the target.
struct ScriptReader {
    tracks: Vec<Track>,
    packets: Vec<Packet>,
    cursor: usize,
    batch: usize,
    seekable: bool,
    /// Every low-level seek target, for assertions.
    seeks: Arc<Mutex<Vec<f64>>>,
    /// Metadata to publish once the cursor passes the given index.
    metadata_at: Option<(usize, Tags)>,
    /// Answer to the bitrate control, when the producer has its own figure.
    bitrate: Option<f64>,
}

impl ScriptReader {
    fn new(tracks: Vec<Track>, packets: Vec<Packet>) -> (ScriptReader, Arc<Mutex<Vec<f64>>>) {
        let seeks = Arc::new(Mutex::new(Vec::new()));
        let reader = ScriptReader {
            tracks,
            packets,
            cursor: 0,
            batch: 4,
            seekable: true,
            seeks: Arc::clone(&seeks),
            metadata_at: None,
            bitrate: None,
        };
        (reader, seeks)
    }
}

impl FormatReader for ScriptReader {
    fn open(&mut self, sink: &mut dyn FormatSink, _check: CheckLevel) -> Result<()> {
        for track in &self.tracks {
            sink.add_track(track.clone());
        }
        Ok(())
    }

    fn fill(&mut self, sink: &mut dyn FormatSink) -> Result<usize> {
        if let Some((at, tags)) = self.metadata_at.take() {
            if self.cursor >= at {
                sink.set_metadata(tags);
                sink.changed(Events::producer_bit(0));
            }
            else {
                self.metadata_at = Some((at, tags));
            }
        }

        if self.cursor >= self.packets.len() {
            return Ok(0);
        }
        let n = self.batch.min(self.packets.len() - self.cursor);
        for _ in 0..n {
            sink.add_packet(self.packets[self.cursor].clone());
            self.cursor += 1;
        }
        Ok(n)
    }

    fn seek(&mut self, pts: f64, _flags: SeekFlags) -> Result<()> {
        self.seeks.lock().unwrap().push(pts);
        self.cursor = self
            .packets
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.track == 0 && p.keyframe && p.ts().map_or(false, |ts| ts <= pts)
            })
            .map(|(i, _)| i)
            .last()
            .unwrap_or(0);
        Ok(())
    }

    fn control(&mut self, ctrl: FormatControl) -> ControlResult {
        match (ctrl, self.bitrate) {
            (FormatControl::Bitrate, Some(bitrate)) => ControlResult::Bitrate(bitrate),
            _ => ControlResult::Unsupported,
        }
    }

    fn source_info(&self) -> SourceInfo {
        SourceInfo { seekable: self.seekable, ..SourceInfo::default() }
    }
}

/// A producer that recognizes nothing.
struct RejectingReader;

impl FormatReader for RejectingReader {
    fn open(&mut self, _sink: &mut dyn FormatSink, _check: CheckLevel) -> Result<()> {
        unsupported_error("unrecognized container")
    }

    fn fill(&mut self, _sink: &mut dyn FormatSink) -> Result<usize> {
        Ok(0)
    }

    fn seek(&mut self, _pts: f64, _flags: SeekFlags) -> Result<()> {
        Ok(())
    }

    fn source_info(&self) -> SourceInfo {
        SourceInfo::default()
    }
}

/// A producer with no usable signature: it refuses the source below the given check level.
struct PickyReader {
    inner: ScriptReader,
    accept_at: CheckLevel,
}

impl FormatReader for PickyReader {
    fn open(&mut self, sink: &mut dyn FormatSink, check: CheckLevel) -> Result<()> {
        if check < self.accept_at {
            return unsupported_error("no signature at this check level");
        }
        self.inner.open(sink, check)
    }

    fn fill(&mut self, sink: &mut dyn FormatSink) -> Result<usize> {
        self.inner.fill(sink)
    }

    fn seek(&mut self, pts: f64, flags: SeekFlags) -> Result<()> {
        self.inner.seek(pts, flags)
    }

    fn control(&mut self, ctrl: FormatControl) -> ControlResult {
        self.inner.control(ctrl)
    }

    fn source_info(&self) -> SourceInfo {
        self.inner.source_info()
    }
}

fn video_track() -> Track {
    Track::new(1, TrackType::Video).with_codec_params(CodecParameters::new().for_codec("h264"))
}

fn audio_track(id: u32) -> Track {
    Track::new(id, TrackType::Audio).with_codec_params(CodecParameters::new().for_codec("aac"))
}

/// Build an interleaved timeline: a video packet every 250 ms with a keyframe every other
/// packet, plus `audio_tracks` audio tracks with an all-keyframe packet at each step. Positions
/// strictly increase in emission order.
fn make_av(duration: f64, audio_tracks: usize) -> Vec<Packet> {
    let steps = (duration / 0.25) as usize;
    let mut packets = Vec::new();
    let mut pos = 0u64;

    for i in 0..steps {
        let ts = 0.25 * i as f64;
        packets.push(
            Packet::new(0, Some(ts), Some(ts), vec![0u8; 100])
                .with_pos(pos)
                .with_keyframe(i % 2 == 0),
        );
        pos += 100;
        for a in 0..audio_tracks {
            packets.push(
                Packet::new(1 + a, Some(ts), Some(ts), vec![0u8; 100])
                    .with_pos(pos)
                    .with_keyframe(true),
            );
            pos += 100;
        }
    }
    packets
}

fn open_av(
    duration: f64,
    audio_tracks: usize,
    opts: DemuxerOptions,
) -> (Demuxer, Arc<Mutex<Vec<f64>>>) {
    let mut tracks = vec![video_track()];
    for a in 0..audio_tracks {
        tracks.push(audio_track(2 + a as u32));
    }
    let (reader, seeks) = ScriptReader::new(tracks, make_av(duration, audio_tracks));
    let demuxer = Demuxer::open(Box::new(reader), opts).expect("open failed");
    (demuxer, seeks)
}

fn read_until(demuxer: &mut Demuxer, track: usize, pts: f64) -> Vec<Packet> {
    let mut packets = Vec::new();
    while let Some(p) = demuxer.read_packet(track) {
        let done = p.pts.map_or(false, |ts| ts >= pts);
        packets.push(p);
        if done {
            break;
        }
    }
    packets
}

#[test]
fn linear_read_returns_enqueued_order() {
    let opts = DemuxerOptions {
        seekable_cache: Some(false),
        max_back_bytes: 0,
        ..DemuxerOptions::default()
    };
    let (mut demuxer, _) = open_av(5.0, 1, opts);
    demuxer.select_track(0, true, None);
    demuxer.select_track(1, true, None);

    let mut video = Vec::new();
    while let Some(p) = demuxer.read_packet(0) {
        video.push(p);
    }
    let mut audio = Vec::new();
    while let Some(p) = demuxer.read_packet(1) {
        audio.push(p);
    }

    let expect: Vec<Packet> = make_av(5.0, 1);
    let expect_video: Vec<f64> = expect.iter().filter(|p| p.track == 0).map(|p| p.pts.unwrap()).collect();
    let expect_audio: Vec<f64> = expect.iter().filter(|p| p.track == 1).map(|p| p.pts.unwrap()).collect();

    assert_eq!(video.iter().map(|p| p.pts.unwrap()).collect::<Vec<f64>>(), expect_video);
    assert_eq!(audio.iter().map(|p| p.pts.unwrap()).collect::<Vec<f64>>(), expect_audio);

    // Everything was dequeued and pruned.
    assert_eq!(demuxer.cache_state().total_bytes, 0);
}

#[test]
fn in_cache_back_seek_reuses_buffer() {
    let (mut demuxer, seeks) = open_av(20.0, 1, DemuxerOptions::default());
    demuxer.select_track(0, true, None);
    demuxer.select_track(1, true, None);

    read_until(&mut demuxer, 0, 10.0);
    let n_seeks = seeks.lock().unwrap().len();

    assert!(demuxer.seek(2.0, SeekFlags::empty()));

    // Served from the cache: the producer was not repositioned.
    assert_eq!(seeks.lock().unwrap().len(), n_seeks);

    // Video resumes at the keyframe with the largest entry time at or before the target.
    let p = demuxer.read_packet(0).expect("video packet after cached seek");
    assert!(p.keyframe);
    assert_eq!(p.pts, Some(2.0));

    // And stays monotonic from there.
    let mut last = 2.0;
    for _ in 0..3 {
        let p = demuxer.read_packet(0).expect("video packet");
        assert!(p.pts.unwrap() > last);
        last = p.pts.unwrap();
    }

    // Audio adopted the video keyframe's entry time rather than overshooting it.
    let a = demuxer.read_packet(1).expect("audio packet after cached seek");
    assert_eq!(a.pts, Some(2.0));
}

#[test]
fn cached_seek_replays_identical_packets() {
    let (mut demuxer, _) = open_av(20.0, 1, DemuxerOptions::default());
    demuxer.select_track(0, true, None);

    let before: Vec<f64> = read_until(&mut demuxer, 0, 6.0)
        .iter()
        .filter_map(|p| p.pts)
        .filter(|&ts| ts >= 2.0 && ts <= 4.0)
        .collect();

    assert!(demuxer.seek(2.0, SeekFlags::empty()));

    let after: Vec<f64> = read_until(&mut demuxer, 0, 4.0)
        .iter()
        .filter_map(|p| p.pts)
        .filter(|&ts| ts >= 2.0 && ts <= 4.0)
        .collect();

    assert_eq!(before, after);
}

#[test]
fn refresh_seek_on_late_selection() {
    let (mut demuxer, seeks) = open_av(20.0, 2, DemuxerOptions::default());
    demuxer.select_track(0, true, None);
    demuxer.select_track(1, true, None);

    read_until(&mut demuxer, 0, 3.0);
    let n_seeks = seeks.lock().unwrap().len();

    demuxer.select_track(2, true, Some(3.0));

    // One refresh seek, one second before the reference position.
    let recorded = seeks.lock().unwrap().clone();
    assert_eq!(recorded.len(), n_seeks + 1);
    assert_eq!(*recorded.last().unwrap(), 2.0);

    // The new track fills from before the reference position.
    let a2 = demuxer.read_packet(2).expect("packet for late-enabled track");
    assert!(a2.pts.unwrap() <= 3.0);

    // The established video queue continues without duplicates.
    let v = demuxer.read_packet(0).expect("video packet");
    assert_eq!(v.pts, Some(3.25));
}

#[test]
fn back_seek_joins_ranges() {
    let (mut demuxer, _) = open_av(20.0, 1, DemuxerOptions::default());
    demuxer.select_track(0, true, None);
    demuxer.select_track(1, true, None);

    // Buffer an initial range around [0, 4].
    read_until(&mut demuxer, 0, 4.0);

    // Jump outside it: a fresh range is started.
    assert!(demuxer.seek(8.0, SeekFlags::empty()));
    read_until(&mut demuxer, 0, 12.0);
    assert_eq!(demuxer.cache_state().ranges.len(), 2);

    // Jump back into the first range and play forward until it grows into the second.
    assert!(demuxer.seek(2.0, SeekFlags::empty()));
    loop {
        let state = demuxer.cache_state();
        if state.ranges.len() == 1 {
            break;
        }
        let p = demuxer.read_packet(0).expect("video packet while growing the range");
        assert!(p.pts.unwrap() < 14.0, "ranges never joined");
    }

    let state = demuxer.cache_state();
    assert_eq!(state.ranges.len(), 1);
    assert_eq!(state.ranges[0].0, Some(0.0));
    assert!(state.ranges[0].1.unwrap() >= 12.0);
}

#[test]
fn forward_cap_pauses_and_resumes() {
    let opts = DemuxerOptions {
        readahead_secs: 1000.0,
        max_bytes: 16 * 1024,
        max_back_bytes: 0,
        seekable_cache: Some(false),
        ..DemuxerOptions::default()
    };
    let (mut demuxer, _) = open_av(60.0, 1, opts);
    demuxer.select_track(0, true, None);
    demuxer.select_track(1, true, None);
    demuxer.start_thread().expect("worker start");

    // Trigger read-ahead without consuming anything.
    assert!(matches!(demuxer.read_packet_async(0), PacketStatus::Pending));

    // The worker must hit the forward cap, pause, and raise the soft EOF.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = demuxer.cache_state();
        if demuxer.track_eof(0) && demuxer.track_eof(1) {
            // Never run far past the cap (one producer burst of slack).
            assert!(state.fw_bytes <= 16 * 1024 + 8 * 200);
            break;
        }
        assert!(Instant::now() < deadline, "forward cap never reached");
        std::thread::sleep(Duration::from_millis(10));
    }

    // Draining recovers: every packet of the timeline arrives exactly once.
    let (mut n_video, mut n_audio) = (0usize, 0usize);
    loop {
        let v = demuxer.read_packet(0);
        if v.is_some() {
            n_video += 1;
        }
        let a = demuxer.read_packet(1);
        if a.is_some() {
            n_audio += 1;
        }
        if v.is_none() && a.is_none() && demuxer.cache_state().eof {
            break;
        }
    }
    assert_eq!(n_video, 240);
    assert_eq!(n_audio, 240);
}

#[test]
fn eof_closes_open_block_and_wakeup_fires_once() {
    // A timeline ending mid-block: the last keyframe's block is still open at EOF.
    let packets = vec![
        Packet::new(0, Some(0.0), Some(0.0), vec![0u8; 100]).with_pos(0).with_keyframe(true),
        Packet::new(0, Some(0.25), Some(0.25), vec![0u8; 100]).with_pos(100),
        Packet::new(0, Some(0.5), Some(0.5), vec![0u8; 100]).with_pos(200).with_keyframe(true),
        Packet::new(0, Some(0.75), Some(0.75), vec![0u8; 100]).with_pos(300),
    ];
    let (reader, _) = ScriptReader::new(vec![video_track()], packets);
    let mut demuxer = Demuxer::open(Box::new(reader), DemuxerOptions::default()).unwrap();
    demuxer.select_track(0, true, None);

    for _ in 0..4 {
        assert!(demuxer.read_packet(0).is_some());
    }

    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    demuxer.set_wakeup(move || {
        fired2.fetch_add(1, Ordering::SeqCst);
    });

    // EOF closes the open block and fires the wakeup exactly once.
    assert!(demuxer.read_packet(0).is_none());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(demuxer.read_packet(0).is_none());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let state = demuxer.cache_state();
    assert!(state.eof);
    assert_eq!(state.ranges.last().copied(), Some((Some(0.0), Some(0.75))));
}

#[test]
fn flush_is_idempotent() {
    let (mut demuxer, _) = open_av(10.0, 1, DemuxerOptions::default());
    demuxer.select_track(0, true, None);

    read_until(&mut demuxer, 0, 2.0);

    demuxer.flush();
    let first = demuxer.cache_state();
    demuxer.flush();
    let second = demuxer.cache_state();

    assert_eq!(first.total_bytes, 0);
    assert_eq!(second.total_bytes, 0);
    assert_eq!(first.ranges.len(), second.ranges.len());

    // Reading continues from the producer position after a flush.
    assert!(demuxer.read_packet(0).is_some());
}

#[test]
fn selection_is_idempotent_and_reenabling_refreshes() {
    let (mut demuxer, seeks) = open_av(20.0, 1, DemuxerOptions::default());
    demuxer.select_track(0, true, None);
    demuxer.select_track(1, true, None);

    read_until(&mut demuxer, 0, 2.0);
    let n_seeks = seeks.lock().unwrap().len();

    // Selecting a selected track is a no-op.
    demuxer.select_track(1, true, Some(2.0));
    assert_eq!(seeks.lock().unwrap().len(), n_seeks);

    // Disabling and re-enabling mid-stream triggers a refresh seek.
    demuxer.select_track(1, false, None);
    demuxer.select_track(1, true, Some(2.0));
    let recorded = seeks.lock().unwrap().clone();
    assert_eq!(recorded.len(), n_seeks + 1);
    assert_eq!(*recorded.last().unwrap(), 1.0);
}

#[test]
fn attached_picture_is_emitted_once() {
    let cover = Packet::new(1, Some(0.0), Some(0.0), vec![1u8; 32]).with_keyframe(true);
    let tracks = vec![
        video_track(),
        Track::new(9, TrackType::Video)
            .with_codec_params(CodecParameters::new().for_codec("mjpeg"))
            .with_attached_picture(cover),
    ];
    let (reader, _) = ScriptReader::new(tracks, make_av(2.0, 0));
    let mut demuxer = Demuxer::open(Box::new(reader), DemuxerOptions::default()).unwrap();
    demuxer.select_track(0, true, None);
    demuxer.select_track(1, true, None);

    let pic = demuxer.read_packet(1).expect("attached picture");
    assert_eq!(pic.data.len(), 32);
    assert!(demuxer.read_packet(1).is_none());

    // The picture track is not eager and never stalls the real tracks.
    assert!(demuxer.read_packet(0).is_some());
}

#[test]
fn unseekable_source_refuses_seek() {
    let (mut reader, seeks) = ScriptReader::new(vec![video_track()], make_av(5.0, 0));
    reader.seekable = false;
    let mut demuxer = Demuxer::open(Box::new(reader), DemuxerOptions::default()).unwrap();
    demuxer.select_track(0, true, None);

    read_until(&mut demuxer, 0, 1.0);
    assert!(!demuxer.seek(0.0, SeekFlags::empty()));
    assert!(seeks.lock().unwrap().is_empty());

    // Reading continues, unaffected by the refused seek.
    assert!(demuxer.read_packet(0).is_some());
}

#[test]
fn force_seekable_permits_imprecise_seeks() {
    let (mut reader, seeks) = ScriptReader::new(vec![video_track()], make_av(20.0, 0));
    reader.seekable = false;
    let opts = DemuxerOptions { force_seekable: true, ..DemuxerOptions::default() };
    let mut demuxer = Demuxer::open(Box::new(reader), opts).unwrap();
    assert!(demuxer.partially_seekable());
    demuxer.select_track(0, true, None);

    read_until(&mut demuxer, 0, 1.0);
    assert!(demuxer.seek(10.0, SeekFlags::empty()));
    assert_eq!(seeks.lock().unwrap().last().copied(), Some(10.0));
}

#[test]
fn metadata_updates_are_coalesced() {
    let mut tags = Tags::new();
    tags.push(Tag::new("title", "scripted stream"));

    let (mut reader, _) = ScriptReader::new(vec![video_track()], make_av(5.0, 0));
    reader.metadata_at = Some((8, tags));
    let mut demuxer = Demuxer::open(Box::new(reader), DemuxerOptions::default()).unwrap();
    assert_eq!(demuxer.num_tracks(), 1);
    demuxer.select_track(0, true, None);

    read_until(&mut demuxer, 0, 4.0);

    let events = demuxer.update();
    assert!(events.contains(Events::METADATA));
    assert!(events.intersects(Events::from_bits_retain(Events::PRODUCER_MASK)));
    assert!(demuxer.metadata().get("title").is_some());

    // Events are consumed by the update.
    assert!(demuxer.update().is_empty());
}

#[test]
fn cc_track_is_created_for_video() {
    let (reader, _) = ScriptReader::new(vec![video_track(), audio_track(2)], make_av(2.0, 1));
    let opts = DemuxerOptions { sub_create_cc_track: true, ..DemuxerOptions::default() };
    let demuxer = Demuxer::open(Box::new(reader), opts).unwrap();

    assert_eq!(demuxer.num_tracks(), 3);
    let cc = demuxer
        .tracks()
        .iter()
        .find(|t| t.track_type == TrackType::Subtitle)
        .expect("closed-caption track");
    assert_eq!(cc.codec_params.codec.as_deref(), Some("eia_608"));
}

#[test]
fn async_read_reports_eof_for_lazy_tracks() {
    let tracks = vec![video_track(), Track::new(5, TrackType::Subtitle)];
    // No subtitle packets at all in the timeline.
    let (reader, _) = ScriptReader::new(tracks, make_av(5.0, 0));
    let mut demuxer = Demuxer::open(Box::new(reader), DemuxerOptions::default()).unwrap();
    demuxer.select_track(0, true, None);
    demuxer.select_track(1, true, None);

    read_until(&mut demuxer, 0, 1.0);

    // The subtitle track is lazy while video is eager: no pending wait, just EOF.
    assert!(matches!(demuxer.read_packet_async(1), PacketStatus::Eof));
}

#[test]
fn open_with_probes_down_to_unconditional_accept() {
    // The first candidate recognizes nothing; the second accepts only when asked to take the
    // source unconditionally, so every stricter probing round must fail first.
    let (inner, _) = ScriptReader::new(vec![video_track()], make_av(2.0, 0));
    let candidates: Vec<Box<dyn FormatReader>> = vec![
        Box::new(RejectingReader),
        Box::new(PickyReader { inner, accept_at: CheckLevel::Force }),
    ];

    let mut demuxer =
        Demuxer::open_with(candidates, DemuxerOptions::default()).expect("probe succeeds");
    assert_eq!(demuxer.num_tracks(), 1);

    demuxer.select_track(0, true, None);
    assert!(demuxer.read_packet(0).is_some());
}

#[test]
fn open_with_reports_unrecognized_source() {
    let candidates: Vec<Box<dyn FormatReader>> = vec![Box::new(RejectingReader)];
    assert!(Demuxer::open_with(candidates, DemuxerOptions::default()).is_err());
}

#[test]
fn producer_bitrate_wins_over_estimate() {
    let (mut reader, _) = ScriptReader::new(vec![video_track()], make_av(5.0, 0));
    reader.bitrate = Some(128_000.0);
    let mut demuxer = Demuxer::open(Box::new(reader), DemuxerOptions::default()).unwrap();
    demuxer.select_track(0, true, None);

    // Enough dequeues for a windowed estimate to exist; the producer's figure still wins.
    read_until(&mut demuxer, 0, 2.0);
    assert_eq!(demuxer.track_bitrate(0), Some(128_000.0));

    // Same answer through the worker's control forwarding.
    demuxer.start_thread().expect("worker start");
    assert_eq!(demuxer.track_bitrate(0), Some(128_000.0));
}

#[test]
fn bitrate_falls_back_to_windowed_estimate() {
    let (mut demuxer, _) = open_av(5.0, 0, DemuxerOptions::default());
    demuxer.select_track(0, true, None);

    // Nothing dequeued yet and no producer figure: no bitrate at all.
    assert_eq!(demuxer.track_bitrate(0), None);

    read_until(&mut demuxer, 0, 2.0);
    let bitrate = demuxer.track_bitrate(0).expect("windowed estimate");
    assert!(bitrate > 0.0);
}

#[test]
fn cancellation_reports_eof() {
    let cancel = Arc::new(AtomicBool::new(false));
    let opts = DemuxerOptions { cancel: Some(Arc::clone(&cancel)), ..DemuxerOptions::default() };
    let (mut demuxer, _) = open_av(20.0, 0, opts);
    demuxer.select_track(0, true, None);

    assert!(demuxer.read_packet(0).is_some());

    cancel.store(true, Ordering::SeqCst);
    // Buffered packets drain, then the cancelled producer reads as end-of-stream.
    while demuxer.read_packet(0).is_some() {}
    assert!(demuxer.cache_state().eof);
}
