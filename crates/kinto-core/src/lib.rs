//! kinto-core: shared vocabulary of the Kinto control plane.
//!
//! Everything here is free of I/O: the persisted domain types, the
//! forward-only release build state machine, the `kinto.toml` repository
//! manifest, and the subscription primitives that watch operations use to
//! move events from a producer task to a consumer.

pub mod manifest;
pub mod release;
pub mod types;
pub mod watch;

pub use manifest::{KintoFile, ManifestError};
pub use release::{BuildState, InvalidTransition, is_valid_transition};
pub use types::*;
pub use watch::{Publisher, Subscription, SubscriptionClosed, subscription};
