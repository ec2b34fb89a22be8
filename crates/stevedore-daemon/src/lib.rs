//! # stevedore-daemon
//!
//! The daemon composes the core pieces into the running control loop: a
//! single cooperative sync loop, the image poller and automator, a job
//! worker, and the HTTP API the CLI talks to.

#![warn(clippy::all)]

pub mod automator;
pub mod daemon;
pub mod images;
pub mod server;
pub mod sync_loop;
pub mod worker;

pub use daemon::{Daemon, DaemonError};
