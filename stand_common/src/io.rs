//! Boundary traits between the sequence engine and the outside world.
//!
//! The engine performs no device I/O itself: every output command goes
//! through a [`DeviceCommandSink`], sensor values come from a
//! [`TelemetrySource`], and run-lifecycle notifications go to a
//! [`SequenceListener`]. Implementations are contracted to be fast and
//! non-blocking — a sink that blocks stalls the timer thread.
//!
//! The traits are deliberately thin so tests can substitute recorders
//! and production can wire CAN drivers, socket bridges, etc. without the
//! engine knowing.

use std::collections::HashMap;

/// A single sensor reading with its acquisition time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Measured value in the sensor's native unit.
    pub value: f64,
    /// Acquisition timestamp [µs since process epoch].
    pub timestamp_us: u64,
}

/// Fire-and-forget dispatch of numeric outputs to a named device.
pub trait DeviceCommandSink: Send + Sync {
    /// Send `values` to `device`. `immediate` bypasses any queueing the
    /// implementation may do for scheduled commands.
    fn execute(&self, device: &str, values: &[f64], immediate: bool);
}

/// Source of the latest telemetry snapshot, polled once per tick.
pub trait TelemetrySource: Send + Sync {
    /// Latest value per sensor name. Sensors absent from the map are
    /// simply skipped by the safety check on that tick.
    fn latest(&self) -> HashMap<String, Measurement>;
}

/// Run-lifecycle notifications emitted by the sequence manager.
///
/// All methods default to no-ops; implementors override what they need.
/// A typical implementation forwards these to the operator channel
/// (timer-start, timer-sync, timer-done, abort).
pub trait SequenceListener: Send + Sync {
    /// A sequence has been accepted and its timer started.
    fn on_start(&self) {}

    /// Periodic progress broadcast with elapsed sequence time [s].
    fn on_progress(&self, _elapsed_s: f64) {}

    /// The sequence ran to its end time and completed normally.
    fn on_done(&self) {}

    /// The sequence was aborted; `reason` names the cause.
    fn on_abort(&self, _reason: &str) {}
}

/// Consumer of state-change events drained from the state controller's
/// event queue.
pub trait StateChangeSink: Send + Sync {
    /// A state entry was written with a new value.
    fn state_changed(&self, name: &str, value: f64);
}

impl<F> StateChangeSink for F
where
    F: Fn(&str, f64) + Send + Sync,
{
    fn state_changed(&self, name: &str, value: f64) {
        self(name, value)
    }
}
