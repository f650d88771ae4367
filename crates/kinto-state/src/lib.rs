//! kinto-state: the state store behind the Kinto controller.
//!
//! [`Store`] is the contract the controller consumes: CRUD over
//! environments, blocks and releases, runtime queries (health, metrics,
//! instances), routing records, teleport sessions, and three push-based
//! watches. [`StateStore`] implements it on top of
//! [redb](https://docs.rs/redb).
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{env}/{block}`, `{env}/{block}:{id}`) allow prefix
//! scans for everything owned by a block or an environment, which is how
//! deletes cascade.
//!
//! Watches are driven by an in-process broadcast hub: every write that
//! changes a block's releases publishes an event, and each watcher task
//! re-reads the projection it serves. Runtime agents feed job status and
//! console output through the same hub.

pub mod error;
pub mod events;
pub mod store;
pub mod tables;
pub mod traits;

pub use error::{StoreError, StoreErrorKind, StoreResult};
pub use events::StoreEvent;
pub use store::StateStore;
pub use traits::Store;
