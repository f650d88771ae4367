//! kinto-build: the build service as seen by the Kinto controller.
//!
//! [`BuildClient`] is the contract: trigger a build for a release, abort
//! it, stream its logs, and fetch a repository's `kinto.toml`. Build
//! status and commit metadata flow back through the controller, not
//! through this client.
//!
//! [`LocalBuildClient`] is an in-process implementation: triggered builds
//! land on a queue a worker drains, log lines are published through a
//! broadcast hub, and manifests come from an in-memory registry or a
//! directory of checked-out repositories.

pub mod client;
pub mod error;
pub mod local;

pub use client::{BuildClient, BuildRequest};
pub use error::{BuildError, BuildResult};
pub use local::LocalBuildClient;
