//! Compiled sequence data model.
//!
//! A sequence run is compiled once, at start, into immutable pre-sorted
//! arrays consumed through monotonically advancing cursors:
//!
//! - [`TimedTrack`] — per-device keyframes; the active segment is the
//!   (previous, next) pair bracketing the current tick time.
//! - [`NominalRange`] — per-sensor safety windows; the active window is
//!   the latest one whose start time has been reached.
//!
//! Cursors only ever move forward, so per-tick segment lookup is O(1)
//! amortized and nothing is mutated while iterating.

pub mod parse;

use std::collections::BTreeMap;

use thiserror::Error;

/// Validation error raised while compiling a sequence from JSON.
///
/// Any of these rejects the whole start before the run state ever leaves
/// Idle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SequenceError {
    /// The top-level `globals` object or one of its required numeric
    /// fields is missing or malformed.
    #[error("globals.{0} missing or not a number")]
    BadGlobal(&'static str),

    /// An action carried a string timestamp.
    #[error("no strings as timestamp in action items allowed")]
    StringActionTimestamp,

    /// An action carried a negative timestamp.
    #[error("timestamp in action must be non-negative, got {0}")]
    NegativeActionTimestamp(f64),

    /// A `sensorsNominalRange` entry was not a 2-element numeric array.
    #[error("nominal range of sensor {0:?} not valid, expected [min, max]")]
    MalformedRange(String),

    /// A device keyframe value was not numeric.
    #[error("value for device {0:?} must be numeric")]
    BadDeviceValue(String),
}

/// Interpolation mode between two keyframes of a device track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Hold the previous keyframe's value; a command is only dispatched
    /// when a keyframe boundary is crossed.
    #[default]
    None,
    /// Linear ramp between keyframes; a command is dispatched every tick.
    Linear,
}

impl Interpolation {
    /// Parse a declared mode. Unrecognized modes fall back to [`None`];
    /// the caller decides whether that is worth a log line.
    ///
    /// [`None`]: Interpolation::None
    pub fn parse(mode: &str) -> Self {
        match mode {
            "none" => Self::None,
            "linear" => Self::Linear,
            _ => Self::None,
        }
    }
}

/// A (timestamp, value) waypoint in a device's output track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keyframe {
    /// Time of this waypoint [µs relative to sequence zero].
    pub at_us: i64,
    /// Output value at this waypoint.
    pub value: f64,
}

/// Outcome of sampling a track at one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackSample {
    /// The value the device should be at right now.
    pub value: f64,
    /// Whether the value must be dispatched to the command sink this
    /// tick. `false` means the value is unchanged since the last
    /// dispatch (`Interpolation::None` between keyframes).
    pub dispatch: bool,
}

/// Time-ordered keyframes for one output device.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedTrack {
    keyframes: Vec<Keyframe>,
    mode: Interpolation,
    cursor: usize,
}

impl TimedTrack {
    /// Build a track from keyframes in any order. Keyframes are sorted by
    /// time; on duplicate timestamps the last write wins.
    pub fn new(mut keyframes: Vec<Keyframe>, mode: Interpolation) -> Self {
        keyframes.sort_by_key(|k| k.at_us);
        // Last write wins on equal timestamps, matching ordered-map
        // insertion semantics of the sequence format.
        keyframes.reverse();
        keyframes.dedup_by_key(|k| k.at_us);
        keyframes.reverse();
        Self {
            keyframes,
            mode,
            cursor: 0,
        }
    }

    /// Interpolation mode of this track.
    #[inline]
    pub const fn mode(&self) -> Interpolation {
        self.mode
    }

    /// Keyframes not yet consumed, including the current segment start.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.keyframes.len() - self.cursor
    }

    /// Whether the track still has an active segment.
    #[inline]
    pub fn has_segment(&self) -> bool {
        self.remaining() >= 2
    }

    /// Sample the track at `now_us`, advancing the cursor when a keyframe
    /// boundary is crossed.
    ///
    /// Returns `None` once fewer than two keyframes remain — the track is
    /// exhausted and no further command is produced. Crossing a boundary
    /// consumes the previous keyframe and emits the next keyframe's value
    /// verbatim; at most one boundary is crossed per tick.
    pub fn sample(&mut self, now_us: i64) -> Option<TrackSample> {
        if !self.has_segment() {
            return None;
        }

        let next = self.keyframes[self.cursor + 1];
        if now_us >= next.at_us {
            self.cursor += 1;
            return Some(TrackSample {
                value: next.value,
                dispatch: true,
            });
        }

        let prev = self.keyframes[self.cursor];
        match self.mode {
            Interpolation::Linear => {
                let scale = (next.value - prev.value) / (next.at_us - prev.at_us) as f64;
                Some(TrackSample {
                    value: prev.value + scale * (now_us - prev.at_us) as f64,
                    dispatch: true,
                })
            }
            Interpolation::None => Some(TrackSample {
                value: prev.value,
                dispatch: false,
            }),
        }
    }
}

/// A time-bounded [min, max] safety envelope for a sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeWindow {
    /// Time from which this window applies [µs relative to sequence zero].
    pub from_us: i64,
    /// Lower bound, inclusive.
    pub min: f64,
    /// Upper bound, inclusive.
    pub max: f64,
}

/// Time-ordered safety windows for one sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct NominalRange {
    windows: Vec<RangeWindow>,
    cursor: usize,
}

impl NominalRange {
    /// Build a range from windows in any order. Windows are sorted by
    /// start time; on duplicate start times the last write wins.
    pub fn new(mut windows: Vec<RangeWindow>) -> Self {
        windows.sort_by_key(|w| w.from_us);
        windows.reverse();
        windows.dedup_by_key(|w| w.from_us);
        windows.reverse();
        Self { windows, cursor: 0 }
    }

    /// Retire every window superseded at `now_us`, so that the active
    /// window is the latest one whose start time ≤ now. Returns `true`
    /// if the active window changed this tick.
    pub fn advance(&mut self, now_us: i64) -> bool {
        let mut switched = false;
        while self.cursor + 1 < self.windows.len()
            && self.windows[self.cursor + 1].from_us <= now_us
        {
            self.cursor += 1;
            switched = true;
        }
        switched
    }

    /// The currently active window, if any window exists at all.
    #[inline]
    pub fn current(&self) -> Option<&RangeWindow> {
        self.windows.get(self.cursor)
    }

    /// Total number of windows, consumed or not.
    #[inline]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether this range holds no windows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// One compiled sequence run: immutable except for the track/range
/// cursors advanced by the tick handler.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDefinition {
    /// Per-device keyframe tracks.
    pub tracks: BTreeMap<String, TimedTrack>,
    /// Per-sensor safety envelopes.
    pub ranges: BTreeMap<String, NominalRange>,
    /// Sensor names declared in `globals.ranges`.
    pub range_names: Vec<String>,
    /// Sequence start [µs]; may be negative (countdown).
    pub start_us: i64,
    /// Sequence end [µs], inclusive.
    pub end_us: i64,
    /// Tick interval [µs].
    pub interval_us: i64,
}

/// The fixed command set applied once when a running sequence aborts,
/// returning devices to a safe configuration. Applied without
/// interpolation, in no particular order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbortSequenceDefinition {
    /// (device, value) pairs to apply.
    pub commands: Vec<(String, f64)>,
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_track(mode: Interpolation) -> TimedTrack {
        TimedTrack::new(
            vec![
                Keyframe {
                    at_us: 0,
                    value: 0.0,
                },
                Keyframe {
                    at_us: 1_000_000,
                    value: 10.0,
                },
            ],
            mode,
        )
    }

    #[test]
    fn linear_track_interpolates() {
        let mut track = ramp_track(Interpolation::Linear);

        let s = track.sample(0).unwrap();
        assert_eq!(s.value, 0.0);
        assert!(s.dispatch);

        let s = track.sample(500_000).unwrap();
        assert_eq!(s.value, 5.0);
        assert!(s.dispatch);

        // Crossing the boundary consumes the segment and emits the next
        // keyframe's value verbatim.
        let s = track.sample(1_000_000).unwrap();
        assert_eq!(s.value, 10.0);
        assert!(s.dispatch);

        // No command after the last keyframe is consumed.
        assert!(track.sample(1_100_000).is_none());
    }

    #[test]
    fn none_track_dispatches_only_on_crossing() {
        let mut track = ramp_track(Interpolation::None);

        let s = track.sample(0).unwrap();
        assert_eq!(s.value, 0.0);
        assert!(!s.dispatch);

        let s = track.sample(999_999).unwrap();
        assert_eq!(s.value, 0.0);
        assert!(!s.dispatch);

        let s = track.sample(1_000_000).unwrap();
        assert_eq!(s.value, 10.0);
        assert!(s.dispatch);

        assert!(track.sample(2_000_000).is_none());
    }

    #[test]
    fn one_boundary_crossed_per_tick() {
        let mut track = TimedTrack::new(
            vec![
                Keyframe { at_us: 0, value: 1.0 },
                Keyframe {
                    at_us: 1_000,
                    value: 2.0,
                },
                Keyframe {
                    at_us: 2_000,
                    value: 3.0,
                },
            ],
            Interpolation::None,
        );

        // A late tick past both boundaries still only crosses one.
        let s = track.sample(5_000).unwrap();
        assert_eq!(s.value, 2.0);
        let s = track.sample(5_000).unwrap();
        assert_eq!(s.value, 3.0);
        assert!(track.sample(5_000).is_none());
    }

    #[test]
    fn keyframes_sorted_and_deduped_last_wins() {
        let track = TimedTrack::new(
            vec![
                Keyframe {
                    at_us: 2_000,
                    value: 9.0,
                },
                Keyframe { at_us: 0, value: 1.0 },
                Keyframe { at_us: 0, value: 4.0 },
            ],
            Interpolation::None,
        );
        assert_eq!(track.remaining(), 2);

        let mut track = track;
        let s = track.sample(0).unwrap();
        assert_eq!(s.value, 4.0);
    }

    #[test]
    fn single_keyframe_has_no_segment() {
        let mut track = TimedTrack::new(
            vec![Keyframe { at_us: 0, value: 7.0 }],
            Interpolation::Linear,
        );
        assert!(!track.has_segment());
        assert!(track.sample(0).is_none());
    }

    #[test]
    fn range_switches_exactly_once() {
        let mut range = NominalRange::new(vec![
            RangeWindow {
                from_us: 0,
                min: 10.0,
                max: 20.0,
            },
            RangeWindow {
                from_us: 5_000_000,
                min: 0.0,
                max: 5.0,
            },
        ]);

        assert!(!range.advance(0));
        assert_eq!(range.current().unwrap().max, 20.0);

        assert!(!range.advance(4_999_999));
        assert_eq!(range.current().unwrap().max, 20.0);

        assert!(range.advance(5_000_000));
        assert_eq!(range.current().unwrap().max, 5.0);

        // Further ticks stay on the second window without re-switching.
        assert!(!range.advance(6_000_000));
        assert_eq!(range.current().unwrap().max, 5.0);
    }

    #[test]
    fn range_skips_multiple_superseded_windows() {
        let mut range = NominalRange::new(vec![
            RangeWindow {
                from_us: 0,
                min: 0.0,
                max: 1.0,
            },
            RangeWindow {
                from_us: 1_000,
                min: 0.0,
                max: 2.0,
            },
            RangeWindow {
                from_us: 2_000,
                min: 0.0,
                max: 3.0,
            },
        ]);

        assert!(range.advance(10_000));
        assert_eq!(range.current().unwrap().max, 3.0);
    }

    #[test]
    fn interpolation_parse_fallback() {
        assert_eq!(Interpolation::parse("linear"), Interpolation::Linear);
        assert_eq!(Interpolation::parse("none"), Interpolation::None);
        assert_eq!(Interpolation::parse("cubic"), Interpolation::None);
        assert_eq!(Interpolation::parse(""), Interpolation::None);
    }
}
