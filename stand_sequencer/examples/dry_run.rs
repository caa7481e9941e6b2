//! Dry run of a short test sequence against console sinks.
//!
//! Plays a 2-second fuel-valve ramp with a tank-pressure safety window
//! and prints every command the engine would send to the devices. Flip
//! `SIMULATED_PRESSURE` outside the window to watch the auto-abort path
//! fire the abort track instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use stand_common::config::StandConfig;
use stand_common::io::{DeviceCommandSink, Measurement, SequenceListener, TelemetrySource};
use stand_sequencer::SequenceManager;

const SIMULATED_PRESSURE: f64 = 15.0;

struct ConsoleSink;

impl DeviceCommandSink for ConsoleSink {
    fn execute(&self, device: &str, values: &[f64], immediate: bool) {
        println!("  -> {device} = {values:?} (immediate: {immediate})");
    }
}

struct SimulatedTelemetry;

impl TelemetrySource for SimulatedTelemetry {
    fn latest(&self) -> HashMap<String, Measurement> {
        HashMap::from([(
            "tank_pressure".to_string(),
            Measurement {
                value: SIMULATED_PRESSURE,
                timestamp_us: 0,
            },
        )])
    }
}

struct ConsoleListener;

impl SequenceListener for ConsoleListener {
    fn on_start(&self) {
        println!("sequence started");
    }
    fn on_progress(&self, elapsed_s: f64) {
        println!("t = {elapsed_s:.1} s");
    }
    fn on_done(&self) {
        println!("sequence done");
    }
    fn on_abort(&self, reason: &str) {
        println!("ABORT: {reason}");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let sequence = json!({
        "globals": {
            "startTime": 0.0,
            "endTime": 2.0,
            "interval": 0.1,
            "ranges": ["tank_pressure"],
            "interpolation": { "fuel_valve": "linear" }
        },
        "data": [
            {
                "timestamp": "START",
                "actions": [
                    {
                        "timestamp": 0.0,
                        "fuel_valve": 0.0,
                        "sensorsNominalRange": { "tank_pressure": [10.0, 20.0] }
                    }
                ]
            },
            { "timestamp": "END", "actions": [ { "timestamp": 0.0, "fuel_valve": 100.0 } ] }
        ]
    });
    let abort = json!({
        "actions": { "timestamp": 0.0, "fuel_valve": 0.0, "vent_valve": 1.0 }
    });

    let config = StandConfig::default();
    let manager = SequenceManager::new(
        &config,
        Arc::new(ConsoleSink),
        Arc::new(SimulatedTelemetry),
        Arc::new(ConsoleListener),
    );

    if !manager.start_sequence(&sequence, &abort, "dry run") {
        eprintln!("sequence rejected");
        return;
    }

    while manager.is_sequence_running() {
        thread::sleep(Duration::from_millis(50));
    }
}
