//! Sequence playback and safety state machine.
//!
//! Owns the timer and drives it: each tick advances the per-device
//! tracks, dispatches resulting values to the command sink, retires
//! expired safety windows and checks current telemetry against the
//! active windows, aborting to the safe device configuration on
//! violation.
//!
//! All mutable run state sits behind one mutex; every tick and every
//! external call (start/abort/stop/is-running) takes it for its full
//! critical section. The lock is never held across a call into the
//! command sink or telemetry source, and the only path back to Idle from
//! a fault is [`SequenceManager::abort_sequence`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use stand_common::config::StandConfig;
use stand_common::io::{DeviceCommandSink, SequenceListener, TelemetrySource};
use stand_common::sequence::{AbortSequenceDefinition, SequenceDefinition};

use crate::timer::Timer;

/// Playback run state. Exactly one holds at a time; `Running` and
/// `Aborting` are mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// No sequence active.
    #[default]
    Idle,
    /// A sequence is being played back.
    Running,
    /// A running sequence is being torn down after an abort.
    Aborting,
}

impl RunState {
    /// Allowed (from, to) transition table.
    const fn allows(self, to: RunState) -> bool {
        matches!(
            (self, to),
            (RunState::Idle, RunState::Running)
                | (RunState::Running, RunState::Idle)
                | (RunState::Running, RunState::Aborting)
                | (RunState::Aborting, RunState::Idle)
        )
    }
}

/// Mutable run state, guarded by the one sequence mutex.
struct SeqState {
    run: RunState,
    /// Guards the abort track against concurrent self-invocation.
    abort_applying: bool,
    definition: Option<SequenceDefinition>,
    abort_definition: AbortSequenceDefinition,
}

impl SeqState {
    /// Apply a transition, logging a bug loudly if it is not in the
    /// allowed table. The transition is applied regardless: a stuck run
    /// state would leave actuators running unsupervised, which is worse
    /// than an inconsistent log line.
    fn transition(&mut self, to: RunState) {
        if self.run.allows(to) {
            debug!(from = ?self.run, ?to, "run state transition");
        } else {
            error!(from = ?self.run, ?to, "run state transition not in allowed table");
        }
        self.run = to;
    }
}

struct Shared {
    seq: Mutex<SeqState>,
    timer: Timer,
    commands: Arc<dyn DeviceCommandSink>,
    telemetry: Arc<dyn TelemetrySource>,
    listener: Arc<dyn SequenceListener>,
    auto_abort: bool,
    sync_interval_us: i64,
}

/// Drives sequence playback: timer ownership, track dispatch, telemetry
/// safety checks and the abort path.
///
/// Constructed explicitly with its collaborators injected; safe to share
/// across threads behind its own synchronization (all methods take
/// `&self`).
pub struct SequenceManager {
    shared: Arc<Shared>,
}

impl SequenceManager {
    /// Create an idle manager.
    pub fn new(
        config: &StandConfig,
        commands: Arc<dyn DeviceCommandSink>,
        telemetry: Arc<dyn TelemetrySource>,
        listener: Arc<dyn SequenceListener>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                seq: Mutex::new(SeqState {
                    run: RunState::Idle,
                    abort_applying: false,
                    definition: None,
                    abort_definition: AbortSequenceDefinition::default(),
                }),
                timer: Timer::new("sequence-timer"),
                commands,
                telemetry,
                listener,
                auto_abort: config.auto_abort,
                sync_interval_us: config.sync_interval_us(),
            }),
        }
    }

    /// Compile and start a sequence run.
    ///
    /// Returns `false` without touching any state when a sequence is
    /// already active, or when either spec fails validation — validation
    /// failures are reported through the listener's abort channel so
    /// they reach the operator.
    pub fn start_sequence(&self, sequence: &Value, abort: &Value, comment: &str) -> bool {
        if self.is_sequence_running() {
            warn!("cannot start sequence: a sequence is already active");
            return false;
        }

        let definition = match SequenceDefinition::from_json(sequence) {
            Ok(definition) => definition,
            Err(e) => {
                error!(%e, "sequence rejected");
                self.shared.listener.on_abort(&e.to_string());
                return false;
            }
        };
        let abort_definition = match AbortSequenceDefinition::from_json(abort) {
            Ok(definition) => definition,
            Err(e) => {
                error!(%e, "abort sequence rejected");
                self.shared.listener.on_abort(&e.to_string());
                return false;
            }
        };

        let (start_us, end_us, interval_us) =
            (definition.start_us, definition.end_us, definition.interval_us);

        {
            let mut st = self.shared.seq.lock();
            // Re-check under the lock; another starter may have won.
            if st.run != RunState::Idle || st.abort_applying {
                warn!(state = ?st.run, "cannot start sequence: a sequence is already active");
                return false;
            }
            // The previous run's definition is discarded here.
            st.definition = Some(definition);
            st.abort_definition = abort_definition;
            st.transition(RunState::Running);
        }

        info!(comment, start_us, end_us, interval_us, "starting sequence");
        self.shared.listener.on_start();

        let tick_shared = Arc::clone(&self.shared);
        let stop_shared = Arc::clone(&self.shared);
        let started = self.shared.timer.start(
            start_us,
            end_us,
            interval_us,
            move |now_us| tick_shared.tick(now_us),
            move || stop_shared.sequence_complete(),
        );

        if let Err(e) = started {
            error!(%e, "failed to start sequence timer");
            self.shared.seq.lock().transition(RunState::Idle);
            return false;
        }

        // An abort arriving between the Running transition above and the
        // spawn finds no worker to stop and walks the state back to Idle
        // on its own; the freshly spawned timer must not outlive it.
        let stale = self.shared.seq.lock().run != RunState::Running;
        if stale {
            warn!("sequence aborted while its timer was starting, stopping it");
            self.shared.timer.stop();
            return false;
        }
        true
    }

    /// Abort the running sequence: stop the timer synchronously, notify
    /// listeners and apply the abort track exactly once.
    ///
    /// A no-op (with a warning) when no sequence is running. Safe to call
    /// from any thread, including from inside the tick handler.
    pub fn abort_sequence(&self, reason: &str) {
        self.shared.abort(reason);
    }

    /// Completion callback for the timer; also callable directly.
    ///
    /// On the natural completion path this returns the run state to Idle
    /// and notifies listeners; during an abort the abort path owns the
    /// transition and this does nothing.
    pub fn stop_sequence(&self) {
        self.shared.sequence_complete();
    }

    /// Apply every abort-track command unconditionally, exactly once.
    ///
    /// Rejected while a main sequence is running and while another
    /// application of the track is in flight.
    pub fn start_abort_sequence(&self) {
        self.shared.apply_abort_track();
    }

    /// Whether a sequence is active — playing back or aborting.
    pub fn is_sequence_running(&self) -> bool {
        let st = self.shared.seq.lock();
        st.run != RunState::Idle || st.abort_applying
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        self.shared.seq.lock().run
    }
}

impl Drop for SequenceManager {
    fn drop(&mut self) {
        if self.is_sequence_running() {
            warn!("sequence manager dropped while a sequence is active, aborting");
            self.shared.abort("sequence manager dropped");
        }
    }
}

impl Shared {
    /// One timer tick. Runs on the timer thread.
    fn tick(&self, now_us: i64) {
        {
            // Nothing may reach the listener or the sink once the run is
            // no longer active; a late tick racing an abort bails before
            // any progress broadcast.
            let st = self.seq.lock();
            if st.run != RunState::Running {
                return;
            }
        }

        if now_us % 500_000 == 0 {
            debug!(micro_time = now_us, "sequence time");
        }
        if now_us % self.sync_interval_us == 0 {
            self.listener.on_progress(now_us as f64 / 1_000_000.0);
        }

        // Polled once per tick, before the sequence lock.
        let telemetry = self.telemetry.latest();

        let mut dispatches: Vec<(String, f64)> = Vec::new();
        let mut violations: Vec<String> = Vec::new();
        {
            let mut st = self.seq.lock();
            if st.run != RunState::Running {
                // A late tick racing an abort; the cancel flag is already
                // set and the loop exits after this returns.
                return;
            }
            let Some(def) = st.definition.as_mut() else {
                return;
            };

            for (device, track) in def.tracks.iter_mut() {
                if let Some(sample) = track.sample(now_us) {
                    if sample.dispatch {
                        dispatches.push((device.clone(), sample.value));
                    }
                }
            }

            for (sensor, range) in def.ranges.iter_mut() {
                if range.advance(now_us) {
                    debug!(sensor = %sensor, ms = now_us / 1000, "nominal range window switched");
                }
            }

            if self.auto_abort {
                for (sensor, range) in def.ranges.iter() {
                    let Some(window) = range.current() else {
                        continue;
                    };
                    // Sensors absent from the snapshot are skipped on
                    // this tick.
                    let Some(measurement) = telemetry.get(sensor) else {
                        continue;
                    };
                    let value = measurement.value;
                    let elapsed_s = now_us as f64 / 1_000_000.0;
                    if value < window.min {
                        violations.push(format!(
                            "sensor {sensor}: value {value} too low (min {min}) at {elapsed_s:.2} s",
                            min = window.min
                        ));
                    } else if value > window.max {
                        violations.push(format!(
                            "sensor {sensor}: value {value} too high (max {max}) at {elapsed_s:.2} s",
                            max = window.max
                        ));
                    }
                }
            }
        }

        for (device, value) in &dispatches {
            self.commands.execute(device, std::slice::from_ref(value), false);
        }

        if !violations.is_empty() {
            self.abort(&format!("auto abort: {}", violations.join("; ")));
        }
    }

    fn abort(&self, reason: &str) {
        {
            let mut st = self.seq.lock();
            if st.run != RunState::Running {
                warn!("cannot abort sequence: no running sequence");
                return;
            }
            st.transition(RunState::Aborting);
        }

        // Synchronous: from an external thread this joins the timer
        // thread, so no tick can race the abort track below. From inside
        // the tick handler it only flags cancellation and the loop exits
        // once the handler returns.
        self.timer.stop();

        error!(reason, "aborting sequence");
        self.listener.on_abort(reason);

        self.apply_abort_track();

        self.seq.lock().transition(RunState::Idle);
    }

    fn apply_abort_track(&self) {
        let commands;
        {
            let mut st = self.seq.lock();
            if st.run == RunState::Running {
                warn!("cannot apply abort track while a sequence is running");
                return;
            }
            if st.abort_applying {
                warn!("abort track is already being applied");
                return;
            }
            st.abort_applying = true;
            commands = st.abort_definition.commands.clone();
        }

        for (device, value) in &commands {
            info!(device = %device, value, "abort track command");
            self.commands.execute(device, std::slice::from_ref(value), false);
        }

        self.seq.lock().abort_applying = false;
        debug!("abort track applied");
    }

    /// Timer completion callback.
    fn sequence_complete(&self) {
        let mut st = self.seq.lock();
        match st.run {
            RunState::Running => {
                st.transition(RunState::Idle);
                drop(st);
                info!("sequence done");
                self.listener.on_done();
            }
            RunState::Aborting => debug!("timer stopped for abort"),
            RunState::Idle => debug!("timer stop callback with no active sequence"),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
