//! kintod: the Kinto control plane daemon.
//!
//! Assembles the redb state store, the in-process build service, the
//! controller chain (audit → metrics → environment guard → controller) and
//! the REST API into one process.

pub mod config;
pub mod daemon;

pub use config::DaemonConfig;
pub use daemon::{Daemon, init_tracing, run};
