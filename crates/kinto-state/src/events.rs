//! In-process event hub that drives store watches.

use kinto_core::{ConsoleLog, JobStatus};
use tokio::sync::broadcast;

/// Events fanned out to watcher tasks.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A release of the block was inserted or updated, or the block's
    /// active release / suspension changed, or the block was deleted.
    ReleasesChanged { env_id: String, block_name: String },
    Job(JobStatus),
    Console(ConsoleLog),
}

impl StoreEvent {
    pub(crate) fn releases_changed(env_id: &str, block_name: &str) -> Self {
        StoreEvent::ReleasesChanged {
            env_id: env_id.to_string(),
            block_name: block_name.to_string(),
        }
    }

    /// Whether the event concerns the given block.
    pub fn targets(&self, env_id: &str, block_name: &str) -> bool {
        let (env, block) = match self {
            StoreEvent::ReleasesChanged {
                env_id,
                block_name,
            } => (env_id, block_name),
            StoreEvent::Job(job) => (&job.env_id, &job.block_name),
            StoreEvent::Console(log) => (&log.env_id, &log.block_name),
        };
        env == env_id && block == block_name
    }
}

/// Broadcast capacity; slower watchers observe `Lagged` and resync.
pub(crate) const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub(crate) struct EventHub {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no watcher is not an error.
    pub(crate) fn publish(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
