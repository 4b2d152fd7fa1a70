// Cadenza
// Copyright (c) 2023-2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `bridge` module carries metadata and lifecycle events between the three views of the
//! demuxer: the producer (writing through [`DemuxSink`]), the buffer (the staged changes under
//! the lock), and the consumer (its private [`ConsumerView`], refreshed by `Demuxer::update`).
//!
//! Change notifications are coalesced as an [`Events`] bitmask until the consumer reads them.

use crate::formats::{Events, FormatSink, Track};
use crate::meta::Tags;
use crate::packet::Packet;
use crate::units::Ts;

use super::state::{DemuxState, Shared};

/// Producer-side changes staged under the lock until the consumer's next update. Tag bags are
/// moved out on update, not cloned, so a bag has exactly one owner at any time.
#[derive(Default)]
pub(crate) struct StagedChanges {
    pub events: Events,
    pub metadata: Option<Tags>,
    pub track_tags: Vec<(usize, Tags)>,
    pub duration: Option<f64>,
}

/// The consumer's private copy of the demuxer's metadata. Only `Demuxer::update` touches it, so
/// the consumer can read it without holding the lock.
#[derive(Default)]
pub(crate) struct ConsumerView {
    pub metadata: Tags,
    pub duration: Ts,
    pub start_time: Ts,
    pub tracks: Vec<Track>,
}

impl DemuxState {
    /// Move the staged changes into the consumer view and return the coalesced events.
    pub fn apply_update(&mut self, view: &mut ConsumerView) -> Events {
        let events = self.staged.events;
        self.staged.events = Events::empty();

        if events.contains(Events::STREAMS) || view.tracks.len() != self.tracks.len() {
            view.tracks = self.tracks.iter().map(|t| t.track.clone()).collect();
        }

        if let Some(tags) = self.staged.metadata.take() {
            view.metadata = tags;
        }

        for (idx, tags) in self.staged.track_tags.drain(..) {
            if let Some(track) = view.tracks.get_mut(idx) {
                track.tags = tags;
            }
        }

        if let Some(duration) = self.staged.duration.take() {
            view.duration = Some(duration);
        }
        else if view.duration.is_none() {
            view.duration = self.source.duration;
        }

        view.start_time = self.source.start_time;

        events
    }
}

/// The producer's handle into the demuxer. Every call takes the state lock; the worker has
/// dropped it around the producer call that received this sink.
pub(crate) struct DemuxSink<'a> {
    pub shared: &'a Shared,
}

impl FormatSink for DemuxSink<'_> {
    fn add_track(&mut self, track: Track) -> usize {
        let mut state = self.shared.state.lock();
        let index = state.add_track(track);
        drop(state);
        self.shared.cond.notify_all();
        index
    }

    fn add_packet(&mut self, packet: Packet) {
        let mut state = self.shared.state.lock();
        let appended = state.add_packet(packet);
        let wakeup = state.take_wakeup();
        drop(state);
        if appended {
            self.shared.cond.notify_all();
        }
        if let Some(wakeup) = wakeup {
            wakeup();
        }
    }

    fn set_metadata(&mut self, tags: Tags) {
        let mut state = self.shared.state.lock();
        state.staged.metadata = Some(tags);
        state.staged.events |= Events::METADATA;
    }

    fn update_track_tags(&mut self, track: usize, tags: Tags) {
        let mut state = self.shared.state.lock();
        if track < state.tracks.len() {
            state.tracks[track].track.tags = tags.clone();
            state.staged.track_tags.push((track, tags));
            state.staged.events |= Events::METADATA;
        }
    }

    fn set_duration(&mut self, duration: f64) {
        let mut state = self.shared.state.lock();
        state.staged.duration = Some(duration);
        state.staged.events |= Events::DURATION;
    }

    fn changed(&mut self, events: Events) {
        let mut state = self.shared.state.lock();
        state.staged.events |= events;
    }

    fn access_references(&self) -> bool {
        self.shared.state.lock().access_references
    }
}
