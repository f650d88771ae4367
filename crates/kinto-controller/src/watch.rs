//! Relay from a source subscription to a caller-supplied destination.
//!
//! Every watch operation ends in [`relay`]: one subscription, one
//! destination, one loop. The loop stops on the first of
//!
//! - `cancel` firing → `Ok(())`
//! - the source ending → `Ok(())`
//! - the source failing → its error, tagged with the watch name
//! - the destination channel closing → `Ok(())`
//! - the destination callback rejecting an event → `Aborted`
//!
//! and closes the subscription on the way out, whichever it was.

use std::future::Future;

use kinto_core::{JobStatus, Subscription};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ControlError, ControlResult};

/// Raised by a watch callback to stop the watch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Destination of `watch_jobs_status`.
pub type JobStatusCallback = Box<dyn FnMut(JobStatus) -> Result<(), SinkError> + Send>;

/// Outcome of handing one event to a destination.
#[derive(Debug)]
pub enum Delivery {
    Delivered,
    /// Nobody is listening any more.
    Closed,
    Rejected(SinkError),
}

/// Anything a watch can deliver events to.
pub trait EventSink<T>: Send {
    fn deliver(&mut self, item: T) -> impl Future<Output = Delivery> + Send;
}

impl<T: Send> EventSink<T> for mpsc::Sender<T> {
    fn deliver(&mut self, item: T) -> impl Future<Output = Delivery> + Send {
        async move {
            match self.send(item).await {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Closed,
            }
        }
    }
}

impl<'a> EventSink<JobStatus> for Box<dyn FnMut(JobStatus) -> Result<(), SinkError> + Send + 'a> {
    fn deliver(&mut self, item: JobStatus) -> impl Future<Output = Delivery> + Send {
        let outcome = match (**self)(item) {
            Ok(()) => Delivery::Delivered,
            Err(e) => Delivery::Rejected(e),
        };
        std::future::ready(outcome)
    }
}

/// Pump `source` into `sink` until one side stops or `cancel` fires.
pub async fn relay<T, E, S>(
    what: &str,
    mut source: Subscription<T, E>,
    cancel: &CancellationToken,
    sink: &mut S,
) -> ControlResult<()>
where
    T: Send,
    E: Into<ControlError> + Send,
    S: EventSink<T>,
{
    let outcome = loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            event = source.next() => event,
        };
        let item = match event {
            Some(Ok(item)) => item,
            Some(Err(e)) => break Err(Into::<ControlError>::into(e).at(what)),
            None => break Ok(()),
        };
        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            delivered = sink.deliver(item) => delivered,
        };
        match delivered {
            Delivery::Delivered => {}
            Delivery::Closed => break Ok(()),
            Delivery::Rejected(e) => {
                break Err(ControlError::Aborted(format!("{what}: destination rejected event: {e}")));
            }
        }
    };
    source.close();
    debug!(watch = what, ok = outcome.is_ok(), "watch ended");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinto_core::{JobState, subscription};
    use kinto_state::StoreError;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn job(state: JobState) -> JobStatus {
        JobStatus {
            env_id: "prod".to_string(),
            block_name: "cron".to_string(),
            release_id: "r1".to_string(),
            state,
            message: None,
            updated_at: 1,
        }
    }

    #[tokio::test]
    async fn relays_in_order_until_source_ends() {
        let (publisher, sub) = subscription::<u32, StoreError>(8);
        for i in 1..=3 {
            publisher.send(i).await.unwrap();
        }
        drop(publisher);

        let (mut tx, mut rx) = mpsc::channel(8);
        relay("numbers", sub, &CancellationToken::new(), &mut tx)
            .await
            .unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(n) = rx.recv().await {
            seen.push(n);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn source_error_is_terminal_and_tagged() {
        let (publisher, sub) = subscription::<u32, StoreError>(8);
        publisher.send(1).await.unwrap();
        publisher.fail(StoreError::NotFound("block api".into())).await;

        let (mut tx, _rx) = mpsc::channel(8);
        let err = relay("watch_releases_status", sub, &CancellationToken::new(), &mut tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        assert!(err.message().starts_with("watch_releases_status: "));
    }

    #[tokio::test]
    async fn cancel_stops_relay_and_releases_source() {
        let (publisher, sub) = subscription::<u32, StoreError>(8);
        let cancel = CancellationToken::new();
        let (mut tx, mut rx) = mpsc::channel(8);

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { relay("numbers", sub, &cancel, &mut tx).await })
        };
        publisher.send(1).await.unwrap();
        assert_eq!(rx.recv().await, Some(1));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), publisher.cancelled())
            .await
            .expect("source subscription must be released");
        assert!(publisher.send(2).await.is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_destination_ends_quietly() {
        let (publisher, sub) = subscription::<u32, StoreError>(8);
        publisher.send(1).await.unwrap();
        let (mut tx, rx) = mpsc::channel(1);
        drop(rx);

        relay("numbers", sub, &CancellationToken::new(), &mut tx)
            .await
            .unwrap();
        assert!(publisher.is_closed());
    }

    #[tokio::test]
    async fn callback_rejection_aborts() {
        let (publisher, sub) = subscription::<JobStatus, StoreError>(8);
        publisher.send(job(JobState::Running)).await.unwrap();
        publisher.send(job(JobState::Failed)).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut callback: JobStatusCallback = {
            let seen = seen.clone();
            Box::new(move |status: JobStatus| {
                seen.lock().unwrap().push(status.state);
                if status.state == JobState::Failed {
                    Err(SinkError("stop".to_string()))
                } else {
                    Ok(())
                }
            })
        };

        let err = relay("watch_jobs_status", sub, &CancellationToken::new(), &mut callback)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Aborted);
        assert_eq!(*seen.lock().unwrap(), vec![JobState::Running, JobState::Failed]);
        assert!(publisher.is_closed());
    }

    #[tokio::test]
    async fn callback_may_borrow_from_the_caller() {
        let (publisher, sub) = subscription::<JobStatus, StoreError>(8);
        publisher.send(job(JobState::Succeeded)).await.unwrap();
        drop(publisher);

        let mut states = Vec::new();
        {
            let mut callback: Box<dyn FnMut(JobStatus) -> Result<(), SinkError> + Send + '_> =
                Box::new(|status: JobStatus| {
                    states.push(status.state);
                    Ok(())
                });
            relay("watch_jobs_status", sub, &CancellationToken::new(), &mut callback)
                .await
                .unwrap();
        }
        assert_eq!(states, vec![JobState::Succeeded]);
    }
}
