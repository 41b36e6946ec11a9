use std::time::Duration;

use async_trait::async_trait;
use ingest_api::CounterRegistry;

use crate::error::BrokerError;
use crate::traits::{Broker, Message, Subscription};

/// Decorates a [`Broker`] with `queue_operations_total{operation,result}`
/// counters (`spec.md` §6), the same shape
/// `ingest_engine::metrics_destination::MetricsDestination` uses for
/// storage operations.
pub struct MetricsBroker<B> {
    inner: B,
    metrics: CounterRegistry,
}

impl<B> MetricsBroker<B> {
    pub fn new(inner: B, metrics: CounterRegistry) -> Self {
        Self { inner, metrics }
    }

    fn record(&self, operation: &str, result: &str) {
        self.metrics.inc("queue_operations_total", &[("operation", operation), ("result", result)]);
    }
}

#[async_trait]
impl<B: Broker> Broker for MetricsBroker<B> {
    async fn publish(&self, subject: &str, bytes: Vec<u8>) -> Result<(), BrokerError> {
        let result = self.inner.publish(subject, bytes).await;
        self.record("publish", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn pull_subscribe(
        &self,
        subject: &str,
        durable_consumer: &str,
        stream: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let inner = self.inner.pull_subscribe(subject, durable_consumer, stream).await?;
        Ok(Box::new(MetricsSubscription { inner, metrics: self.metrics.clone() }))
    }

    async fn close(&self, timeout: Duration) -> Result<(), BrokerError> {
        self.inner.close(timeout).await
    }
}

struct MetricsSubscription {
    inner: Box<dyn Subscription>,
    metrics: CounterRegistry,
}

impl MetricsSubscription {
    fn record(&self, operation: &str, result: &str) {
        self.metrics.inc("queue_operations_total", &[("operation", operation), ("result", result)]);
    }
}

#[async_trait]
impl Subscription for MetricsSubscription {
    async fn pop(&mut self, max_wait: Duration, batch_size: usize) -> Result<Vec<Box<dyn Message>>, BrokerError> {
        match self.inner.pop(max_wait, batch_size).await {
            Ok(msgs) => {
                self.record("pop", "success");
                Ok(msgs
                    .into_iter()
                    .map(|m| {
                        let data = m.data().to_vec();
                        Box::new(MetricsMessage { data, inner: tokio::sync::Mutex::new(m), metrics: self.metrics.clone() })
                            as Box<dyn Message>
                    })
                    .collect())
            }
            Err(e) => {
                self.record("pop", "error");
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.inner.close().await
    }
}

/// Holds the delivered bytes separately so `data()` can stay
/// synchronous while ack/nak go through a `tokio::sync::Mutex` — the
/// wrapped `Box<dyn Message>` is only `Send`, not `Sync`, and plain
/// interior storage would make this type unusable from `&self`.
struct MetricsMessage {
    data: Vec<u8>,
    inner: tokio::sync::Mutex<Box<dyn Message>>,
    metrics: CounterRegistry,
}

impl MetricsMessage {
    fn record(&self, operation: &str, result: &str) {
        self.metrics.inc("queue_operations_total", &[("operation", operation), ("result", result)]);
    }
}

#[async_trait]
impl Message for MetricsMessage {
    fn data(&self) -> &[u8] {
        &self.data
    }

    async fn ack_sync(&self) -> Result<(), BrokerError> {
        let result = self.inner.lock().await.ack_sync().await;
        self.record("ack", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn nak(&self) -> Result<(), BrokerError> {
        let result = self.inner.lock().await.nak().await;
        self.record("nak", if result.is_ok() { "success" } else { "error" });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    #[tokio::test]
    async fn publish_and_pop_record_queue_operations() {
        let metrics = CounterRegistry::new();
        let inner = MemoryBroker::new();
        inner.declare_stream("STREAM").await;
        let broker = MetricsBroker::new(inner, metrics.clone());

        broker.publish("wf.a", b"hello".to_vec()).await.unwrap();
        let mut sub = broker.pull_subscribe("wf.a", "cons", "STREAM").await.unwrap();
        let msgs = sub.pop(Duration::from_secs(1), 8).await.unwrap();
        assert_eq!(msgs.len(), 1);
        msgs[0].ack_sync().await.unwrap();

        let families = metrics.gather();
        let published = families
            .iter()
            .find(|f| f.name == "queue_operations_total" && f.labels.get("operation").map(String::as_str) == Some("publish"))
            .unwrap();
        assert_eq!(published.value, 1.0);
        let popped = families
            .iter()
            .find(|f| f.name == "queue_operations_total" && f.labels.get("operation").map(String::as_str) == Some("pop"))
            .unwrap();
        assert_eq!(popped.value, 1.0);
        let acked = families
            .iter()
            .find(|f| f.name == "queue_operations_total" && f.labels.get("operation").map(String::as_str) == Some("ack"))
            .unwrap();
        assert_eq!(acked.value, 1.0);
    }
}
