//! Kiln daemon library
//!
//! Exports the daemon's configuration and supervision loops for the binary
//! and for testing.

pub mod config;
pub mod supervisor;
