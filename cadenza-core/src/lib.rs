// Cadenza
// Copyright (c) 2023-2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Project Cadenza is a buffering demuxer layer for media players.
//!
//! It sits between a raw container parser (the producer, implementing
//! [`formats::FormatReader`]) and one or more decoder consumers, and converts the producer's
//! stream of demuxed packets into a time-indexed, seekable, concurrency-safe packet cache. The
//! producer's blocking I/O runs on a dedicated read-ahead thread, decoupled from the consumers'
//! real-time dequeueing.

pub mod demux;
pub mod errors;
pub mod formats;
pub mod meta;
pub mod packet;
pub mod units;
