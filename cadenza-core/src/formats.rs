// Cadenza
// Copyright (c) 2023-2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `formats` module provides the traits and support structures a raw container parser (the
//! producer) implements to feed the buffering layer.
//!
//! The buffering layer never parses container bytes itself. A [`FormatReader`] owns the byte
//! source, registers tracks, and emits packets into a [`FormatSink`]; the demuxer worker decides
//! when to call it and caches what it produces.

use crate::errors::Result;
use crate::meta::Tags;
use crate::packet::Packet;
use crate::units::Ts;

use bitflags::bitflags;

bitflags! {
    /// Flags qualifying a seek request.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SeekFlags: u32 {
        /// The seek target is a position factor in `0..=1` instead of a time in seconds.
        const FACTOR  = 1 << 0;
        /// Snap to a position at or after the target instead of at or before it.
        const FORWARD = 1 << 1;
        /// The caller wants to land as close to the target as possible; decoders will discard
        /// data preceding it. Keyframe adoption across tracks is skipped.
        const HR      = 1 << 2;
    }
}

bitflags! {
    /// Change notifications coalesced between the producer and the consumer view. Bits remain set
    /// until the consumer calls `Demuxer::update`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Events: u32 {
        /// The demuxer finished initializing.
        const INIT     = 1 << 0;
        /// Container or track metadata changed.
        const METADATA = 1 << 1;
        /// The track list changed.
        const STREAMS  = 1 << 2;
        /// The duration estimate changed.
        const DURATION = 1 << 3;
    }
}

impl Events {
    /// Mask of the event bits reserved for producer-defined notifications. Producers may set any
    /// of these through [`FormatSink::changed`]; the buffering layer carries them through
    /// untouched.
    pub const PRODUCER_MASK: u32 = 0xffff_0000;

    /// Create a producer-defined event from a bit index within [`Events::PRODUCER_MASK`].
    pub fn producer_bit(bit: u32) -> Events {
        debug_assert!(bit < 16);
        Events::from_bits_retain(1 << (16 + bit))
    }
}

/// How strictly a [`FormatReader`] should vet the source before accepting it during open.
///
/// Readers with weak or absent signatures should only accept a source at the more permissive
/// levels; readers with reliable signatures may accept at any level.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum CheckLevel {
    /// Accept only if the source carries a valid format signature.
    Normal,
    /// The format was requested by name; accept on a plausible signature.
    Request,
    /// Accept even without a recognizable signature.
    Unsafe,
    /// Accept unconditionally.
    Force,
}

/// The track type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TrackType {
    /// A video track.
    Video,
    /// An audio track.
    Audio,
    /// A subtitle track.
    Subtitle,
}

/// Codec parameters for one track. The buffering layer carries these through to decoders without
/// interpreting them.
#[derive(Clone, Debug, Default)]
pub struct CodecParameters {
    /// The codec name, e.g. `h264` or `opus`.
    pub codec: Option<String>,
    /// Codec-specific extra data (sequence headers and the like).
    pub extra_data: Option<Box<[u8]>>,
    /// Video frame width in pixels.
    pub width: Option<u32>,
    /// Video frame height in pixels.
    pub height: Option<u32>,
    /// Audio sample rate in Hz.
    pub sample_rate: Option<u32>,
    /// Audio channel count.
    pub channels: Option<u32>,
}

impl CodecParameters {
    /// Create empty codec parameters.
    pub fn new() -> CodecParameters {
        CodecParameters::default()
    }

    /// Provide the codec name.
    pub fn for_codec(mut self, codec: &str) -> Self {
        self.codec = Some(codec.to_string());
        self
    }
}

/// A `Track` describes one logical elementary stream registered by the producer.
///
/// A track is immutable after registration, except for its tag bag, which the producer may
/// replace through [`FormatSink::update_track_tags`]. Tracks are never removed.
#[derive(Clone, Debug)]
pub struct Track {
    /// The index of the track within the demuxer, assigned on registration.
    pub index: usize,
    /// The producer-visible track identifier, e.g. the container's track number.
    pub id: u32,
    /// The track type.
    pub track_type: TrackType,
    /// The codec parameters for the track. Opaque to the buffering layer.
    pub codec_params: CodecParameters,
    /// The tag bag for the track.
    pub tags: Tags,
    /// A single-shot picture attached to the track (cover art). Emitted once on the first read,
    /// after which the track reports end-of-stream.
    pub attached_picture: Option<Packet>,
}

impl Track {
    /// Create a new track with the producer-visible identifier `id`. The demuxer assigns the
    /// index on registration.
    pub fn new(id: u32, track_type: TrackType) -> Track {
        Track {
            index: 0,
            id,
            track_type,
            codec_params: CodecParameters::default(),
            tags: Tags::new(),
            attached_picture: None,
        }
    }

    /// Provide the codec parameters.
    pub fn with_codec_params(mut self, codec_params: CodecParameters) -> Self {
        self.codec_params = codec_params;
        self
    }

    /// Provide the track tags.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Provide an attached picture.
    pub fn with_attached_picture(mut self, picture: Packet) -> Self {
        self.attached_picture = Some(picture);
        self
    }
}

/// Facts about the byte source underneath a producer, read once after open and again when the
/// producer signals a change.
#[derive(Clone, Debug, Default)]
pub struct SourceInfo {
    /// True if the source supports seeking.
    pub seekable: bool,
    /// True if the source is read over a network transport.
    pub is_network: bool,
    /// True if a byte-level cache sits between the source and the producer.
    pub has_upstream_cache: bool,
    /// Total size of the source in bytes, if known.
    pub size: Option<u64>,
    /// Start time of the media in seconds, if known.
    pub start_time: Ts,
    /// Duration of the media in seconds, if known.
    pub duration: Ts,
}

/// Queries and notifications forwarded from the consumer to the producer. The demux worker calls
/// [`FormatReader::control`] with the state lock dropped and folds the result back in atomically.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FormatControl {
    /// The set of selected tracks changed. A producer performing native track selection should
    /// re-read the selection through its next fill.
    SwitchedTracks,
    /// Query the producer's own bitrate estimate.
    Bitrate,
    /// Query the total byte size of the source.
    StreamSize,
    /// Query the state of the upstream byte cache.
    CacheInfo,
}

/// State of an upstream byte-level cache, reported by the producer.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct UpstreamCacheInfo {
    /// Bytes buffered ahead of the producer's read position.
    pub cached_bytes: u64,
    /// Fill rate in bytes per second, if measured.
    pub speed: Option<f64>,
    /// True if the upstream cache reached the end of the source.
    pub eof: bool,
}

/// The result of a [`FormatControl`] query.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ControlResult {
    /// The control was handled and carries no data.
    Ok,
    /// The producer does not support this control.
    Unsupported,
    /// The producer's bitrate estimate, in bits per second.
    Bitrate(f64),
    /// The total byte size of the source.
    StreamSize(u64),
    /// The state of the upstream byte cache.
    CacheInfo(UpstreamCacheInfo),
}

/// The producer's view of the demuxer.
///
/// A `FormatSink` is passed to [`FormatReader::open`] and [`FormatReader::fill`]. Every call
/// acquires the demuxer state lock internally, so the producer may hold no other demuxer handle
/// while emitting.
pub trait FormatSink {
    /// Register a new track and return its index. Tracks may be registered during open or at any
    /// later fill (e.g. a program change in a broadcast stream).
    fn add_track(&mut self, track: Track) -> usize;

    /// Append one demuxed packet. Packets for unselected tracks, and packets emitted while a seek
    /// is queued, are discarded.
    fn add_packet(&mut self, packet: Packet);

    /// Replace the container-level tag bag.
    fn set_metadata(&mut self, tags: Tags);

    /// Replace one track's tag bag.
    fn update_track_tags(&mut self, track: usize, tags: Tags);

    /// Update the duration estimate, in seconds.
    fn set_duration(&mut self, duration: f64);

    /// Raise change notification bits for the consumer view.
    fn changed(&mut self, events: Events);

    /// True if the demuxer permits following external references (playlists, cue sheets).
    fn access_references(&self) -> bool {
        true
    }
}

/// A `FormatReader` is a raw container parser: the producer side of the buffering layer.
///
/// The demux worker thread drives a `FormatReader` and drops the demuxer state lock around every
/// call into it, so implementations may block on I/O freely. All packet and track registration
/// flows back through the [`FormatSink`] passed to [`FormatReader::fill`].
pub trait FormatReader: Send {
    /// Probe and open the source. Track registration and initial metadata should happen here. An
    /// implementation must respect `check`: with a weak or absent signature it should refuse the
    /// source unless the level permits acceptance.
    fn open(&mut self, sink: &mut dyn FormatSink, check: CheckLevel) -> Result<()>;

    /// Demux one burst of data, emitting zero or more packets into `sink`. Returns the number of
    /// packets emitted, or 0 for end-of-stream.
    fn fill(&mut self, sink: &mut dyn FormatSink) -> Result<usize>;

    /// Seek the source to `pts` (seconds, or a factor when [`SeekFlags::FACTOR`] is set).
    /// [`SeekFlags::HR`] hints that the caller wants the closest possible landing point.
    fn seek(&mut self, pts: f64, flags: SeekFlags) -> Result<()>;

    /// Answer a control query. The default implementation handles nothing.
    fn control(&mut self, _ctrl: FormatControl) -> ControlResult {
        ControlResult::Unsupported
    }

    /// Describe the byte source underneath the reader.
    fn source_info(&self) -> SourceInfo;
}
