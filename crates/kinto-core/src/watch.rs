//! Subscription primitives for push-based watches.
//!
//! A watch is a producer task feeding a bounded channel and a consumer
//! holding the receiving end. [`subscription`] creates both halves, tied
//! together by a cancellation token:
//!
//! - dropping or closing the [`Subscription`] cancels the token, so the
//!   producer observes it through [`Publisher::cancelled`] or a failed
//!   [`Publisher::send`] and exits;
//! - dropping the [`Publisher`] ends the stream, and the consumer sees
//!   `None` from [`Subscription::next`].
//!
//! Every exit path of either side goes through the same token, so a
//! producer can never outlive its consumer.

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Returned by [`Publisher::send`] once the consumer has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("subscription closed")]
pub struct SubscriptionClosed;

/// Create a linked publisher/subscription pair with the given buffer.
pub fn subscription<T, E>(buffer: usize) -> (Publisher<T, E>, Subscription<T, E>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let token = CancellationToken::new();
    (
        Publisher {
            tx,
            token: token.clone(),
        },
        Subscription { rx, token },
    )
}

/// Producing half of a watch.
#[derive(Debug)]
pub struct Publisher<T, E> {
    tx: mpsc::Sender<Result<T, E>>,
    token: CancellationToken,
}

impl<T, E> Publisher<T, E> {
    /// Deliver one event, waiting for buffer space.
    pub async fn send(&self, item: T) -> Result<(), SubscriptionClosed> {
        self.deliver(Ok(item)).await
    }

    /// Deliver a terminal error and end the stream.
    pub async fn fail(self, err: E) {
        let _ = self.deliver(Err(err)).await;
    }

    /// Resolves once the consumer closes or drops the subscription.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }

    async fn deliver(&self, item: Result<T, E>) -> Result<(), SubscriptionClosed> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SubscriptionClosed),
            sent = self.tx.send(item) => sent.map_err(|_| SubscriptionClosed),
        }
    }
}

/// Consuming half of a watch. Dropping it tears the producer down.
#[derive(Debug)]
pub struct Subscription<T, E> {
    rx: mpsc::Receiver<Result<T, E>>,
    token: CancellationToken,
}

impl<T, E> Subscription<T, E> {
    /// Next event, or `None` once the producer has finished.
    pub async fn next(&mut self) -> Option<Result<T, E>> {
        if self.token.is_cancelled() {
            return None;
        }
        self.rx.recv().await
    }

    /// Stop the producer and discard anything still buffered.
    pub fn close(mut self) {
        self.shutdown();
    }

    /// Token observed by the producer; useful to tie extra cleanup to it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        self.rx.close();
    }
}

impl<T, E> Drop for Subscription<T, E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn events_arrive_in_order_then_end() {
        let (publisher, mut sub) = subscription::<u32, String>(4);
        tokio::spawn(async move {
            for i in 0..3 {
                publisher.send(i).await.unwrap();
            }
        });

        let mut seen = Vec::new();
        while let Some(event) = sub.next().await {
            seen.push(event.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn terminal_error_is_last_event() {
        let (publisher, mut sub) = subscription::<u32, String>(4);
        publisher.send(7).await.unwrap();
        publisher.fail("boom".to_string()).await;

        assert_eq!(sub.next().await, Some(Ok(7)));
        assert_eq!(sub.next().await, Some(Err("boom".to_string())));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn dropping_subscription_stops_a_blocked_producer() {
        let (publisher, sub) = subscription::<u32, ()>(1);
        let producer = tokio::spawn(async move {
            let mut sent = 0u32;
            while publisher.send(sent).await.is_ok() {
                sent += 1;
            }
            sent
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(sub);

        let sent = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer must exit after the subscription is dropped")
            .unwrap();
        assert!(sent >= 1);
    }

    #[tokio::test]
    async fn close_wakes_cancelled_future() {
        let (publisher, sub) = subscription::<u32, ()>(1);
        assert!(!publisher.is_closed());
        sub.close();
        tokio::time::timeout(Duration::from_secs(1), publisher.cancelled())
            .await
            .unwrap();
        assert!(publisher.is_closed());
        assert_eq!(publisher.send(1).await, Err(SubscriptionClosed));
    }
}
