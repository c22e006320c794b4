//! Scheduled backup tool
//!
//! Dumps every database, archives a directory tree, mirrors both to a remote
//! store and prunes artifacts older than the retention window.

pub mod backup;
pub mod config;
pub mod errors;
pub mod remote;
pub mod utils;

#[cfg(test)]
mod testutil;
