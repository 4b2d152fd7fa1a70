// Cadenza
// Copyright (c) 2023-2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `units` module provides definitions for common units.
//!
//! All timestamps and durations in Cadenza are seconds expressed as `f64`. An unknown timestamp
//! ("no PTS") is `None`; the helpers in this module fold optional timestamps without letting an
//! unknown value poison the result.

/// A timestamp or duration in seconds. `None` means the value is unknown.
pub type Ts = Option<f64>;

/// A queue accepts a new highest-seen timestamp when it is not a regression, or when it jumps
/// backward by more than this many seconds. The latter tolerates container timestamp resets.
/// Treat as a tunable.
pub const TS_RESET_TOLERANCE: f64 = 10.0;

/// Minimum timestamp window, in seconds, over which packet bitrate is estimated.
pub const BITRATE_WINDOW: f64 = 0.5;

/// Returns the smaller of two optional timestamps, ignoring unknown values.
#[inline]
pub fn ts_min(a: Ts, b: Ts) -> Ts {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Returns the larger of two optional timestamps, ignoring unknown values.
#[inline]
pub fn ts_max(a: Ts, b: Ts) -> Ts {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Clamps `ts` to the closed interval `[start, end]`. Unknown bounds do not constrain.
#[inline]
pub fn ts_clamp(ts: Ts, start: Ts, end: Ts) -> Ts {
    ts_min(ts_max(ts, start), end)
}

#[cfg(test)]
mod tests {
    use super::{ts_clamp, ts_max, ts_min};

    #[test]
    fn verify_ts_folds() {
        assert_eq!(ts_min(Some(1.0), Some(2.0)), Some(1.0));
        assert_eq!(ts_min(None, Some(2.0)), Some(2.0));
        assert_eq!(ts_min(Some(1.0), None), Some(1.0));
        assert_eq!(ts_min(None, None), None);

        assert_eq!(ts_max(Some(1.0), Some(2.0)), Some(2.0));
        assert_eq!(ts_max(None, Some(2.0)), Some(2.0));
        assert_eq!(ts_max(None, None), None);

        assert_eq!(ts_clamp(Some(5.0), Some(1.0), Some(3.0)), Some(3.0));
        assert_eq!(ts_clamp(Some(0.5), Some(1.0), Some(3.0)), Some(1.0));
        assert_eq!(ts_clamp(Some(2.0), None, None), Some(2.0));
        assert_eq!(ts_clamp(None, Some(1.0), Some(3.0)), Some(1.0));
    }
}
