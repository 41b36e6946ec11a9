use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer};
use async_trait::async_trait;

use crate::error::BrokerError;
use crate::traits::{Broker, Message, Subscription};

/// Broker backed by a real NATS JetStream server. Stream and consumer
/// provisioning (`stream-replicas`, `max-msgs`, consumer durable name)
/// happens out of band, via the server's CLI flags (`spec.md` §6) —
/// this type only publishes and binds to what already exists.
#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsBroker {
    pub async fn connect(endpoint: &str) -> Result<Self, BrokerError> {
        let client = async_nats::connect(endpoint)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }

    /// Provision the stream named by `--stream`, sized by `--stream-replicas`
    /// and `--max-msgs` (`spec.md` §6). Idempotent: binds to the stream if it
    /// already exists instead of failing.
    pub async fn provision_stream(&self, stream: &str, replicas: usize, max_msgs: i64) -> Result<(), BrokerError> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream.to_string(),
                subjects: vec![format!("{stream}.>"), stream.to_string()],
                num_replicas: replicas,
                max_messages: max_msgs,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(())
    }

    /// Provision the durable, explicit-ack pull consumer a
    /// `WorkflowRunner` dequeuer binds to (`spec.md` §3, "Consumer
    /// binding"). Idempotent.
    pub async fn provision_consumer(&self, stream: &str, durable_consumer: &str, subject: &str) -> Result<(), BrokerError> {
        let stream_handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|_| BrokerError::NoSuchStream(stream.to_string()))?;
        stream_handle
            .get_or_create_consumer(
                durable_consumer,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_consumer.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        Ok(())
    }
}

struct NatsMessage(jetstream::Message);

#[async_trait]
impl Message for NatsMessage {
    fn data(&self) -> &[u8] {
        &self.0.payload
    }

    async fn ack_sync(&self) -> Result<(), BrokerError> {
        self.0.ack().await.map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nak(&self) -> Result<(), BrokerError> {
        self.0
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

struct NatsSubscription {
    consumer: PullConsumer,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn pop(&mut self, max_wait: Duration, batch_size: usize) -> Result<Vec<Box<dyn Message>>, BrokerError> {
        use futures_util::StreamExt;

        let mut batch = self
            .consumer
            .batch()
            .max_messages(batch_size)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| BrokerError::Pop(e.to_string()))?;

        let mut out = Vec::with_capacity(batch_size);
        while let Some(next) = batch.next().await {
            match next {
                Ok(msg) => out.push(Box::new(NatsMessage(msg)) as Box<dyn Message>),
                Err(e) => return Err(BrokerError::Pop(e.to_string())),
            }
        }
        Ok(out)
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, subject: &str, bytes: Vec<u8>) -> Result<(), BrokerError> {
        self.jetstream
            .publish(subject.to_string(), bytes.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn pull_subscribe(
        &self,
        _subject: &str,
        durable_consumer: &str,
        stream: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let stream_handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|_| BrokerError::NoSuchStream(stream.to_string()))?;
        let consumer: PullConsumer = stream_handle
            .get_consumer(durable_consumer)
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        Ok(Box::new(NatsSubscription { consumer }))
    }

    async fn close(&self, timeout: Duration) -> Result<(), BrokerError> {
        let _ = tokio::time::timeout(timeout, self.client.flush()).await;
        self.client
            .drain()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))
    }
}
