//! kinto-controller: the orchestration layer of the Kinto control plane.
//!
//! [`ControllerApi`] is the single contract exposed to clients. It is
//! implemented by the [`Controller`], which runs every workflow against a
//! [`Store`](kinto_state::Store) and a
//! [`BuildClient`](kinto_build::BuildClient), and by decorators that wrap
//! it. [`build_chain`] links an ordered list of implementations into one
//! entry point:
//!
//! ```text
//! client ─► Audit ─► Metrics ─► Guard ─► Controller ─► {Store, BuildClient}
//! ```
//!
//! A decorator overrides only the operations it cares about; everything
//! else forwards to the next link unchanged.

pub mod api;
pub mod chain;
pub mod config;
pub mod controller;
pub mod error;
pub mod middleware;
pub mod validate;
pub mod watch;

pub use api::ControllerApi;
pub use chain::{ChainError, Link, build_chain, successor};
pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::{ControlError, ControlResult, ErrorKind};
pub use middleware::{AuditMiddleware, EnvironmentGuard, MetricsMiddleware};
pub use watch::{JobStatusCallback, SinkError};
