//! RTSP camera gateway library crate.
//!
//! Owns the set of active camera streams, drives each through its lifecycle
//! state machine and exposes the control-plane surface used by the binary.

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod orchestrator;

pub use error::{Error, Result};
