//! Core library for the scanrun observatory automation daemon.
//!
//! scanrun executes a night's observing queue: it watches the scan queue
//! file, talks to the device-control daemons over the command bus, runs
//! calibration and science-exposure programs cooperatively, and records a
//! terminal outcome for every request it takes on.

pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod safety;
pub mod scheduler;
pub mod solar;
pub mod status;
pub mod tools;
