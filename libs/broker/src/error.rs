/// Errors surfaced by the [`crate::Broker`] adapter. All variants are
/// transient from the caller's perspective (`spec.md` §4.1): the
/// caller decides whether and when to retry.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connect: {0}")]
    Connect(String),

    #[error("publish: {0}")]
    Publish(String),

    #[error("subscribe: {0}")]
    Subscribe(String),

    #[error("pop: {0}")]
    Pop(String),

    #[error("ack: {0}")]
    Ack(String),

    #[error("stream '{0}' does not exist")]
    NoSuchStream(String),

    #[error("subscription closed")]
    Closed,
}
