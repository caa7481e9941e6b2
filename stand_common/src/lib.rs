//! Stand Common Library
//!
//! Shared types for the test-stand sequence engine: the compiled sequence
//! data model, JSON sequence parsing, the boundary traits the engine calls
//! out through, and process configuration loading.
//!
//! # Module Structure
//!
//! - [`sequence`] - Tracks, nominal ranges and compiled sequence definitions
//! - [`io`] - Boundary traits (command sink, telemetry source, listeners)
//! - [`config`] - TOML process configuration

pub mod config;
pub mod io;
pub mod sequence;
