//! Fleet controller daemon
//!
//! Serves the control plane over HTTP and drives its background loops.

pub mod api;
pub mod config;
