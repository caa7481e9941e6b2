//! Sequence compilation from the JSON wire shape.
//!
//! The sequence format carries dynamic device-name keys inside each
//! action, so parsing works over `serde_json::Value` rather than typed
//! serde structs. All timestamps in the file are seconds; everything is
//! converted to microseconds here and never again.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use super::{
    AbortSequenceDefinition, Interpolation, Keyframe, NominalRange, RangeWindow,
    SequenceDefinition, SequenceError, TimedTrack,
};

/// Seconds (float) → microseconds.
#[inline]
fn to_micros(seconds: f64) -> i64 {
    (seconds * 1_000_000.0) as i64
}

/// Extract a required numeric field from `globals`.
fn global_number(globals: &Value, key: &'static str) -> Result<f64, SequenceError> {
    globals
        .get(key)
        .and_then(Value::as_f64)
        .ok_or(SequenceError::BadGlobal(key))
}

/// Resolve a data item's base timestamp [s].
///
/// `"START"` / `"END"` resolve to the sequence's global start/end time.
/// A missing key or unrecognized string resolves to 0 with a warning.
fn resolve_base_timestamp(item: &Value, start_s: f64, end_s: f64) -> f64 {
    match item.get("timestamp") {
        Some(Value::String(s)) if s == "START" => start_s,
        Some(Value::String(s)) if s == "END" => end_s,
        Some(Value::String(s)) => {
            warn!(timestamp = %s, "unrecognized timestamp sentinel, using 0");
            0.0
        }
        Some(v) => v.as_f64().unwrap_or_else(|| {
            warn!("timestamp of data item not a number, using 0");
            0.0
        }),
        None => {
            warn!("timestamp key of data item does not exist, using 0");
            0.0
        }
    }
}

/// Resolve an action's own timestamp [s].
///
/// Strings and negative values reject the whole sequence.
fn resolve_action_timestamp(action: &Value) -> Result<f64, SequenceError> {
    let time = match action.get("timestamp") {
        Some(Value::String(_)) => return Err(SequenceError::StringActionTimestamp),
        Some(v) => v.as_f64().unwrap_or(0.0),
        None => 0.0,
    };
    if time < 0.0 {
        return Err(SequenceError::NegativeActionTimestamp(time));
    }
    Ok(time)
}

impl SequenceDefinition {
    /// Compile a sequence from its JSON form.
    ///
    /// Resolves every action time against its data item's base time,
    /// splits actions into device keyframes and sensor range windows,
    /// and attaches each device's declared interpolation mode (falling
    /// back to [`Interpolation::None`]).
    pub fn from_json(seq: &Value) -> Result<Self, SequenceError> {
        let globals = seq
            .get("globals")
            .ok_or(SequenceError::BadGlobal("globals"))?;

        let start_s = global_number(globals, "startTime")?;
        let end_s = global_number(globals, "endTime")?;
        let interval_s = global_number(globals, "interval")?;

        let interpolation = load_interpolation_map(globals);
        let range_names = load_range_names(globals);

        let mut keyframes: BTreeMap<String, Vec<Keyframe>> = BTreeMap::new();
        let mut windows: BTreeMap<String, Vec<RangeWindow>> = BTreeMap::new();

        let data = seq.get("data").and_then(Value::as_array);
        for item in data.into_iter().flatten() {
            let base_us = to_micros(resolve_base_timestamp(item, start_s, end_s));

            let actions = item.get("actions").and_then(Value::as_array);
            for action in actions.into_iter().flatten() {
                let at_us = base_us + to_micros(resolve_action_timestamp(action)?);

                let Some(entries) = action.as_object() else {
                    continue;
                };
                for (key, value) in entries {
                    if key == "timestamp" {
                        continue;
                    }
                    if key == "sensorsNominalRange" {
                        collect_range_windows(value, at_us, &mut windows)?;
                    } else {
                        let value = value
                            .as_f64()
                            .ok_or_else(|| SequenceError::BadDeviceValue(key.clone()))?;
                        keyframes
                            .entry(key.clone())
                            .or_default()
                            .push(Keyframe { at_us, value });
                    }
                }
            }
        }

        let tracks = keyframes
            .into_iter()
            .map(|(device, frames)| {
                let mode = interpolation.get(&device).copied().unwrap_or_else(|| {
                    debug!(device = %device, "no interpolation declared, falling back to none");
                    Interpolation::None
                });
                (device, TimedTrack::new(frames, mode))
            })
            .collect();

        let ranges = windows
            .into_iter()
            .map(|(sensor, wins)| (sensor, NominalRange::new(wins)))
            .collect();

        Ok(Self {
            tracks,
            ranges,
            range_names,
            start_us: to_micros(start_s),
            end_us: to_micros(end_s),
            interval_us: to_micros(interval_s),
        })
    }
}

/// Collect `sensorsNominalRange` entries into per-sensor window lists.
fn collect_range_windows(
    ranges: &Value,
    at_us: i64,
    windows: &mut BTreeMap<String, Vec<RangeWindow>>,
) -> Result<(), SequenceError> {
    let Some(entries) = ranges.as_object() else {
        return Err(SequenceError::MalformedRange("sensorsNominalRange".into()));
    };
    for (sensor, bounds) in entries {
        let pair = bounds
            .as_array()
            .filter(|a| a.len() == 2)
            .and_then(|a| Some((a[0].as_f64()?, a[1].as_f64()?)))
            .ok_or_else(|| SequenceError::MalformedRange(sensor.clone()))?;
        windows.entry(sensor.clone()).or_default().push(RangeWindow {
            from_us: at_us,
            min: pair.0,
            max: pair.1,
        });
    }
    Ok(())
}

/// Build the device → interpolation mode map from the globals.
fn load_interpolation_map(globals: &Value) -> BTreeMap<String, Interpolation> {
    let mut map = BTreeMap::new();
    if let Some(entries) = globals.get("interpolation").and_then(Value::as_object) {
        for (device, mode) in entries {
            let mode = mode.as_str().map(Interpolation::parse).unwrap_or_default();
            debug!(device = %device, ?mode, "interpolation mode declared");
            map.insert(device.clone(), mode);
        }
    }
    map
}

/// Collect the sensor names declared under `globals.ranges`.
fn load_range_names(globals: &Value) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(entries) = globals.get("ranges").and_then(Value::as_array) {
        for name in entries {
            match name.as_str() {
                Some(name) => names.push(name.to_owned()),
                None => warn!("range name in sequence globals not a string"),
            }
        }
    }
    names
}

impl AbortSequenceDefinition {
    /// Compile the abort command set from its JSON form.
    ///
    /// Every key of the `actions` object except `timestamp` is a device
    /// name with a numeric target value.
    pub fn from_json(abort: &Value) -> Result<Self, SequenceError> {
        let mut commands = Vec::new();
        match abort.get("actions").and_then(Value::as_object) {
            Some(entries) => {
                for (device, value) in entries {
                    if device == "timestamp" {
                        continue;
                    }
                    let value = value
                        .as_f64()
                        .ok_or_else(|| SequenceError::BadDeviceValue(device.clone()))?;
                    commands.push((device.clone(), value));
                }
            }
            None => warn!("abort sequence has no actions, devices stay as commanded"),
        }
        Ok(Self { commands })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
