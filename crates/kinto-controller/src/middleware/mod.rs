//! Stock decorators for the controller chain.
//!
//! Each embeds a [`Link`](crate::Link), overrides the operations it cares
//! about, and lets the trait defaults forward everything else.

pub mod audit;
pub mod guard;
pub mod metrics;

pub use audit::{AuditEntry, AuditMiddleware};
pub use guard::EnvironmentGuard;
pub use metrics::MetricsMiddleware;
