//! Change-tracked value store bridging sensor/device state across threads.
//!
//! One mutex guards the whole name → entry map — entry counts are small
//! and update rates moderate, so per-entry locking buys nothing. Change
//! notifications never run on the writer's stack: [`StateController::set_state`]
//! enqueues an event into a bounded channel drained by a single consumer
//! thread, so a sink can never re-enter the store (or any lock above it)
//! from inside the state lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use stand_common::io::StateChangeSink;

/// State lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// The named state was never registered.
    #[error("state {0:?} not found")]
    NotFound(String),
}

/// One stored value with its timestamp and change flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateEntry {
    /// Latest written value.
    pub value: f64,
    /// Timestamp of the latest write [µs].
    pub timestamp_us: u64,
    /// Set on every write, cleared only by [`StateController::get_dirty_states`].
    pub dirty: bool,
}

/// A queued change notification.
#[derive(Debug, Clone)]
struct StateChange {
    name: String,
    value: f64,
}

struct Notifier {
    tx: Sender<StateChange>,
    consumer: Option<JoinHandle<()>>,
}

/// Thread-safe change-tracked map from state name to value.
///
/// Entries are registered once and live for the process lifetime; they
/// are mutated but never individually removed.
pub struct StateController {
    states: Mutex<BTreeMap<String, StateEntry>>,
    notifier: Mutex<Option<Notifier>>,
    queue_depth: usize,
}

impl StateController {
    /// Create a store whose change-event queue holds up to `queue_depth`
    /// undrained events.
    pub fn new(queue_depth: usize) -> Self {
        Self {
            states: Mutex::new(BTreeMap::new()),
            notifier: Mutex::new(None),
            queue_depth,
        }
    }

    /// Install the change sink and spawn the consumer thread draining the
    /// event queue into it. One-time; subsequent calls warn and no-op.
    pub fn init(&self, sink: Arc<dyn StateChangeSink>) {
        let mut notifier = self.notifier.lock();
        if notifier.is_some() {
            warn!("state controller already initialized, ignoring");
            return;
        }

        let (tx, rx) = channel::bounded::<StateChange>(self.queue_depth);
        let spawned = thread::Builder::new()
            .name("state-notify".into())
            .spawn(move || {
                for change in rx {
                    sink.state_changed(&change.name, change.value);
                }
                debug!("state change queue closed, notifier exiting");
            });

        match spawned {
            Ok(consumer) => {
                *notifier = Some(Notifier {
                    tx,
                    consumer: Some(consumer),
                });
            }
            Err(e) => error!("failed to spawn state notifier thread: {e}"),
        }
    }

    /// Register entries with value 0.0, timestamp 0 and a clean flag,
    /// overwriting existing entries of the same name.
    pub fn add_uninitialized<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut states = self.states.lock();
        for name in names {
            states.insert(
                name.into(),
                StateEntry {
                    value: 0.0,
                    timestamp_us: 0,
                    dirty: false,
                },
            );
        }
    }

    /// Register entries with explicit initial values, overwriting existing
    /// entries of the same name.
    pub fn add_states<I, S>(&self, initial: I)
    where
        I: IntoIterator<Item = (S, f64, u64)>,
        S: Into<String>,
    {
        let mut states = self.states.lock();
        for (name, value, timestamp_us) in initial {
            states.insert(
                name.into(),
                StateEntry {
                    value,
                    timestamp_us,
                    dirty: false,
                },
            );
        }
    }

    /// Upsert an entry, mark it dirty and enqueue a change notification.
    ///
    /// The notification is delivered asynchronously by the consumer
    /// thread; a full queue drops the event with a warning (the dirty
    /// flags stay authoritative either way).
    pub fn set_state(&self, name: &str, value: f64, timestamp_us: u64) {
        {
            let mut states = self.states.lock();
            states.insert(
                name.to_owned(),
                StateEntry {
                    value,
                    timestamp_us,
                    dirty: true,
                },
            );
        }

        let notifier = self.notifier.lock();
        if let Some(notifier) = notifier.as_ref() {
            let change = StateChange {
                name: name.to_owned(),
                value,
            };
            match notifier.tx.try_send(change) {
                Ok(()) => {}
                Err(TrySendError::Full(change)) => {
                    warn!(state = %change.name, "state change queue full, dropping event");
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("state change consumer gone, dropping event");
                }
            }
        }
    }

    /// Latest value of a registered state.
    pub fn get_state_value(&self, name: &str) -> Result<f64, StateError> {
        self.states
            .lock()
            .get(name)
            .map(|entry| entry.value)
            .ok_or_else(|| StateError::NotFound(name.to_owned()))
    }

    /// Atomically return every entry changed since the previous drain
    /// (value + timestamp) and clear their dirty flags.
    pub fn get_dirty_states(&self) -> BTreeMap<String, (f64, u64)> {
        let mut states = self.states.lock();
        let mut dirties = BTreeMap::new();
        for (name, entry) in states.iter_mut() {
            if entry.dirty {
                dirties.insert(name.clone(), (entry.value, entry.timestamp_us));
                entry.dirty = false;
            }
        }
        dirties
    }

    /// Full diagnostic snapshot, dirty flags included, non-destructive.
    pub fn get_all_states(&self) -> BTreeMap<String, StateEntry> {
        self.states.lock().clone()
    }

    /// Whether every registered entry has been written at least once
    /// (nonzero timestamp).
    pub fn all_initialized(&self) -> bool {
        self.states
            .lock()
            .values()
            .all(|entry| entry.timestamp_us != 0)
    }

    /// Block until every registered entry has been written at least once.
    pub fn wait_until_initialized(&self) {
        while !self.all_initialized() {
            thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}

impl Drop for StateController {
    fn drop(&mut self) {
        // Close the channel so the consumer drains and exits, then join.
        if let Some(mut notifier) = self.notifier.get_mut().take() {
            drop(notifier.tx);
            if let Some(consumer) = notifier.consumer.take() {
                let _ = consumer.join();
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn get_state_value_unknown_is_not_found() {
        let controller = StateController::new(16);
        assert_eq!(
            controller.get_state_value("no_such"),
            Err(StateError::NotFound("no_such".into()))
        );
    }

    #[test]
    fn registration_and_lookup() {
        let controller = StateController::new(16);
        controller.add_uninitialized(["fuel_valve", "ox_valve"]);
        controller.add_states([("tank_pressure", 14.7, 1_000_u64)]);

        assert_eq!(controller.get_state_value("fuel_valve"), Ok(0.0));
        assert_eq!(controller.get_state_value("tank_pressure"), Ok(14.7));

        // Re-registration overwrites.
        controller.add_uninitialized(["tank_pressure"]);
        assert_eq!(controller.get_state_value("tank_pressure"), Ok(0.0));
    }

    #[test]
    fn dirty_drain_semantics() {
        let controller = StateController::new(16);
        controller.add_uninitialized(["x", "y"]);

        // Registration is clean.
        assert!(controller.get_dirty_states().is_empty());

        controller.set_state("x", 1.5, 42);
        let dirty = controller.get_dirty_states();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty["x"], (1.5, 42));

        // Drained once, empty until the next write.
        assert!(controller.get_dirty_states().is_empty());
        assert!(controller.get_dirty_states().is_empty());

        controller.set_state("x", 2.0, 43);
        controller.set_state("y", 3.0, 44);
        let dirty = controller.get_dirty_states();
        assert_eq!(dirty.len(), 2);
    }

    #[test]
    fn snapshot_preserves_dirty_flags() {
        let controller = StateController::new(16);
        controller.add_uninitialized(["x"]);
        controller.set_state("x", 1.0, 1);

        let all = controller.get_all_states();
        assert!(all["x"].dirty);

        // Non-destructive: the flag is still set for the drain.
        assert_eq!(controller.get_dirty_states().len(), 1);
    }

    #[test]
    fn set_state_upserts_unregistered_name() {
        let controller = StateController::new(16);
        controller.set_state("adhoc", 9.0, 5);
        assert_eq!(controller.get_state_value("adhoc"), Ok(9.0));
    }

    #[test]
    fn change_events_reach_sink() {
        let controller = StateController::new(16);
        let seen: Arc<Mutex<Vec<(String, f64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        controller.init(Arc::new(move |name: &str, value: f64| {
            sink_seen.lock().push((name.to_owned(), value));
        }));

        controller.set_state("x", 1.0, 1);
        controller.set_state("x", 2.0, 2);

        // Delivery is asynchronous; give the consumer a moment.
        for _ in 0..100 {
            if seen.lock().len() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let seen = seen.lock().clone();
        assert_eq!(
            seen,
            vec![("x".to_string(), 1.0), ("x".to_string(), 2.0)]
        );
    }

    #[test]
    fn second_init_is_ignored() {
        let controller = StateController::new(16);
        let first: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let first_sink = Arc::clone(&first);
        controller.init(Arc::new(move |_: &str, value: f64| {
            first_sink.lock().push(value);
        }));
        controller.init(Arc::new(|_: &str, _: f64| panic!("second sink used")));

        controller.set_state("x", 7.0, 1);
        for _ in 0..100 {
            if !first.lock().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(first.lock().as_slice(), &[7.0]);
    }

    #[test]
    fn initialization_tracking() {
        let controller = StateController::new(16);
        controller.add_uninitialized(["x", "y"]);
        assert!(!controller.all_initialized());

        controller.set_state("x", 1.0, 10);
        assert!(!controller.all_initialized());

        controller.set_state("y", 1.0, 20);
        assert!(controller.all_initialized());
    }
}
