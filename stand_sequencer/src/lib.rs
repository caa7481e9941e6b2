//! # Stand Sequencer
//!
//! Real-time execution engine for the test stand. Plays back a
//! time-indexed command sequence to output devices while concurrently
//! checking sensor telemetry against time-varying safety envelopes,
//! aborting to a safe device configuration on violation.
//!
//! ## Components
//!
//! - [`timer::Timer`] — drift-free periodic scheduler on a dedicated
//!   OS thread, cooperatively cancellable.
//! - [`state::StateController`] — mutex-guarded change-tracked value
//!   store bridging sensor/device state across threads.
//! - [`sequence::SequenceManager`] — the playback/safety state machine
//!   driving the timer and the abort path.
//!
//! The engine performs no device I/O; commands and telemetry flow
//! through the boundary traits in [`stand_common::io`].

pub mod sequence;
pub mod state;
pub mod timer;

pub use sequence::{RunState, SequenceManager};
pub use state::StateController;
pub use timer::Timer;
