use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

/// One delivered broker message. `ack_sync` is durable: once it
/// returns `Ok`, the broker will not redeliver this message to this
/// durable consumer again.
#[async_trait]
pub trait Message: Send {
    fn data(&self) -> &[u8];

    async fn ack_sync(&self) -> Result<(), BrokerError>;

    /// Negative-ack: request immediate redelivery rather than waiting
    /// for the consumer's ack-wait timeout. Used by the `nak`
    /// `OnError` policy (`spec.md` §9.1).
    async fn nak(&self) -> Result<(), BrokerError>;
}

/// A bound pull subscription over `(stream, durable_consumer,
/// subject)` — owned by exactly one Dequeuer for its lifetime
/// (`spec.md` §3).
#[async_trait]
pub trait Subscription: Send {
    /// Fetch up to `batch_size` messages, waiting up to `max_wait` for
    /// at least one. Must tolerate and internally retry the broker's
    /// own "no messages within server wait" sentinel; returns an empty
    /// batch only once `max_wait` elapses.
    async fn pop(&mut self, max_wait: Duration, batch_size: usize) -> Result<Vec<Box<dyn Message>>, BrokerError>;

    /// Drain and release. Safe to call more than once.
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Thin semantic wrapper around a durable streaming broker: publish on
/// a subject, pull-subscribe with batch fetch and explicit ack
/// (`spec.md` §4.1).
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, subject: &str, bytes: Vec<u8>) -> Result<(), BrokerError>;

    /// Bind to an existing durable consumer on `stream`. Fails if the
    /// stream does not exist.
    async fn pull_subscribe(
        &self,
        subject: &str,
        durable_consumer: &str,
        stream: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Flush pending work with `timeout`, then disconnect.
    async fn close(&self, timeout: Duration) -> Result<(), BrokerError>;
}
