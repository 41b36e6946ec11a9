use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::BrokerError;
use crate::traits::{Broker, Message, Subscription};

type Queue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// An in-process broker for tests and local experimentation without a
/// live NATS server, grounded on `libs/topic-engine`'s
/// mpsc-channel-per-subscriber `Topic`, adapted to the pull-batch +
/// explicit-ack shape `spec.md` §4.1 requires instead of push
/// broadcast. A nak'd message is pushed back to the front of its
/// subject's queue for immediate redelivery.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    streams: Arc<Mutex<HashSet<String>>>,
    subjects: Arc<Mutex<HashMap<String, Queue>>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a stream so `pull_subscribe` can bind to it — mirrors
    /// the CLI's `stream-replicas`/`max-msgs` provisioning step in
    /// `spec.md` §6; there is no real replication to configure here.
    pub async fn declare_stream(&self, stream: &str) {
        self.streams.lock().await.insert(stream.to_string());
    }

    async fn queue_for(&self, subject: &str) -> Queue {
        let mut subjects = self.subjects.lock().await;
        subjects.entry(subject.to_string()).or_default().clone()
    }
}

struct MemoryMessage {
    data: Vec<u8>,
    queue: Queue,
    notify: Arc<Notify>,
    acked: Arc<Mutex<bool>>,
}

#[async_trait]
impl Message for MemoryMessage {
    fn data(&self) -> &[u8] {
        &self.data
    }

    async fn ack_sync(&self) -> Result<(), BrokerError> {
        *self.acked.lock().await = true;
        Ok(())
    }

    async fn nak(&self) -> Result<(), BrokerError> {
        let mut acked = self.acked.lock().await;
        if *acked {
            return Ok(());
        }
        *acked = true;
        self.queue.lock().await.push_front(self.data.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

struct MemorySubscription {
    queue: Queue,
    notify: Arc<Notify>,
    closed: bool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn pop(&mut self, max_wait: Duration, batch_size: usize) -> Result<Vec<Box<dyn Message>>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            {
                let mut q = self.queue.lock().await;
                if !q.is_empty() {
                    let mut out: Vec<Box<dyn Message>> = Vec::new();
                    for _ in 0..batch_size {
                        match q.pop_front() {
                            Some(data) => out.push(Box::new(MemoryMessage {
                                data,
                                queue: self.queue.clone(),
                                notify: self.notify.clone(),
                                acked: Arc::new(Mutex::new(false)),
                            })),
                            None => break,
                        }
                    }
                    return Ok(out);
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, subject: &str, bytes: Vec<u8>) -> Result<(), BrokerError> {
        let queue = self.queue_for(subject).await;
        queue.lock().await.push_back(bytes);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pull_subscribe(
        &self,
        subject: &str,
        _durable_consumer: &str,
        stream: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        if !self.streams.lock().await.contains(stream) {
            return Err(BrokerError::NoSuchStream(stream.to_string()));
        }
        let queue = self.queue_for(subject).await;
        Ok(Box::new(MemorySubscription {
            queue,
            notify: self.notify.clone(),
            closed: false,
        }))
    }

    async fn close(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_pop() {
        let broker = MemoryBroker::new();
        broker.declare_stream("STREAM").await;
        broker.publish("wf.a", b"hello".to_vec()).await.unwrap();

        let mut sub = broker.pull_subscribe("wf.a", "consumer__a", "STREAM").await.unwrap();
        let msgs = sub.pop(Duration::from_secs(1), 8).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].data(), b"hello");
        msgs[0].ack_sync().await.unwrap();
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_subject() {
        let broker = MemoryBroker::new();
        broker.declare_stream("STREAM").await;
        let mut sub = broker.pull_subscribe("wf.empty", "consumer", "STREAM").await.unwrap();
        let msgs = sub.pop(Duration::from_millis(50), 8).await.unwrap();
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn pull_subscribe_fails_on_unknown_stream() {
        let broker = MemoryBroker::new();
        match broker.pull_subscribe("wf.a", "c", "NOPE").await {
            Err(BrokerError::NoSuchStream(_)) => {}
            other => panic!("expected NoSuchStream, got {}", other.err().map(|e| e.to_string()).unwrap_or_default()),
        }
    }

    #[tokio::test]
    async fn nak_requeues_for_redelivery() {
        let broker = MemoryBroker::new();
        broker.declare_stream("STREAM").await;
        broker.publish("wf.a", b"msg".to_vec()).await.unwrap();
        let mut sub = broker.pull_subscribe("wf.a", "c", "STREAM").await.unwrap();

        let msgs = sub.pop(Duration::from_secs(1), 8).await.unwrap();
        msgs[0].nak().await.unwrap();

        let redelivered = sub.pop(Duration::from_secs(1), 8).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].data(), b"msg");
    }

    #[tokio::test]
    async fn batch_size_caps_pop() {
        let broker = MemoryBroker::new();
        broker.declare_stream("STREAM").await;
        for i in 0..5 {
            broker.publish("wf.a", vec![i]).await.unwrap();
        }
        let mut sub = broker.pull_subscribe("wf.a", "c", "STREAM").await.unwrap();
        let msgs = sub.pop(Duration::from_secs(1), 2).await.unwrap();
        assert_eq!(msgs.len(), 2);
    }
}
