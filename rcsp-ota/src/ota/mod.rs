//! The upgrade orchestrator and its session plumbing.

pub mod state;
pub mod timer;
pub mod updater;
