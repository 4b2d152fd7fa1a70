// Cadenza
// Copyright (c) 2023-2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `thread` module implements the demux worker: the read-ahead loop that executes queued
//! controls, track switches, and seeks, and otherwise demuxes until every eager track is
//! satisfied.
//!
//! The worker owns the [`FormatReader`] outright. The state lock is held across the loop and
//! dropped, through [`MutexGuard::unlocked`], strictly around the three producer calls that may
//! block on I/O: `fill`, `seek`, and `control`. In single-threaded mode the consumer drives
//! [`step`] inline with its own reader.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::warn;
use parking_lot::MutexGuard;

use crate::formats::{FormatControl, FormatReader};

use super::bridge::DemuxSink;
use super::state::{ControlSlot, DemuxState, Shared};

/// The worker thread body. Returns the reader so a stopped demuxer can continue single-threaded.
pub(crate) fn run_loop(shared: Arc<Shared>, mut reader: Box<dyn FormatReader>) -> Box<dyn FormatReader> {
    let mut guard = shared.state.lock();
    debug_assert!(guard.threaded);

    loop {
        if guard.thread_terminate {
            break;
        }

        let worked = step(&shared, &mut reader, &mut guard);

        if let Some(wakeup) = guard.take_wakeup() {
            MutexGuard::unlocked(&mut guard, || wakeup());
        }

        if worked {
            shared.cond.notify_all();
            continue;
        }

        guard.idle = true;
        shared.cond.wait(&mut guard);
    }

    drop(guard);
    reader
}

/// Execute one unit of pending work, in priority order: a queued control, a selection change, a
/// queued seek, then demuxing. Returns false if there was nothing to do.
pub(crate) fn step(
    shared: &Shared,
    reader: &mut Box<dyn FormatReader>,
    guard: &mut MutexGuard<'_, DemuxState>,
) -> bool {
    if let ControlSlot::Pending(ctrl) = guard.control {
        let result = MutexGuard::unlocked(guard, || reader.control(ctrl));
        guard.control = ControlSlot::Done(result);
        return true;
    }

    if guard.tracks_switched {
        guard.tracks_switched = false;
        MutexGuard::unlocked(guard, || {
            let _ = reader.control(FormatControl::SwitchedTracks);
        });
        guard.initiate_refresh();
        return true;
    }

    if let Some(seek) = guard.seeking.take() {
        guard.idle = false;
        guard.initial_state = false;
        MutexGuard::unlocked(guard, || {
            if let Err(err) = reader.seek(seek.pts, seek.flags) {
                warn!("low-level seek to {} failed: {}", seek.pts, err);
            }
        });
        guard.eof = false;
        return true;
    }

    if guard.want_read() {
        guard.idle = false;
        guard.initial_state = false;

        // The cancellation probe turns into a producer EOF.
        if guard.cancel.as_ref().map_or(false, |c| c.load(Ordering::Relaxed)) {
            guard.mark_eof();
            return true;
        }

        let result = MutexGuard::unlocked(guard, || {
            let mut sink = DemuxSink { shared };
            reader.fill(&mut sink)
        });

        match result {
            Ok(0) => guard.mark_eof(),
            Ok(_) => (),
            Err(err) => {
                warn!("demuxing failed: {}", err);
                guard.mark_eof();
            }
        }
        return true;
    }

    false
}
