use std::sync::Arc;
use std::time::Duration;

use broker::Broker;
use ingest_api::{codec, CounterRegistry, ErrorKind, Source};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// Drains one source into the broker subject for one workflow
/// (`spec.md` §4.7). Not safe to call `enqueue` concurrently with
/// itself on the same instance — it mutates the source's lazy listing
/// cursor via `Reset`/`Next`.
pub struct Enqueuer {
    source: Arc<dyn Source>,
    broker: Arc<dyn Broker>,
    subject: String,
    metrics: CounterRegistry,
}

impl Enqueuer {
    pub fn new(source: Arc<dyn Source>, broker: Arc<dyn Broker>, subject: impl Into<String>, metrics: CounterRegistry) -> Self {
        Self { source, broker, subject: subject.into(), metrics }
    }

    /// `Reset` then loop `Next`+publish until `Eof` or an error. Every
    /// plugin RPC round-trip is cancel-aware through `cancel`
    /// (`spec.md` §4.3/§5's context deadline).
    pub async fn enqueue(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let result = self.enqueue_inner(cancel).await;
        self.metrics.inc("enqueue_attempts_total", &[("result", if result.is_ok() { "success" } else { "error" })]);
        result
    }

    async fn enqueue_inner(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        self.source.reset(cancel).await?;
        loop {
            match self.source.next(cancel).await {
                Ok(reference) => {
                    let bytes = codec::marshal(&reference)?;
                    self.broker.publish(&self.subject, bytes).await?;
                }
                Err(e) if e.kind() == ErrorKind::Eof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run `enqueue` on a ticker of `interval`. `interval == 0` means
    /// "run once then return." Each tick runs under a derived deadline
    /// of `interval` and to completion before the next is scheduled
    /// (one-tick-at-a-time, `SPEC_FULL.md` §9 Design Note 3), so a slow
    /// pass can never race the next tick's `Reset` and never outlives
    /// its own tick. Exits cleanly when `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        if interval.is_zero() {
            if let Err(e) = self.run_one_tick(None, &cancel).await {
                tracing::error!(subject = %self.subject, error = %e, "enqueue pass failed");
            }
            return;
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; run once right away
        loop {
            if let Err(e) = self.run_one_tick(Some(interval), &cancel).await {
                tracing::error!(subject = %self.subject, error = %e, "enqueue pass failed, retrying next tick");
            }
            if cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
        }
    }

    /// Derives a per-tick child token and, when `timeout` is set, bounds
    /// the pass with it — a hung plugin RPC or broker publish is
    /// cancelled at the tick boundary instead of stalling the workflow
    /// forever.
    async fn run_one_tick(&self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<(), EngineError> {
        let tick_cancel = cancel.child_token();
        match timeout {
            Some(timeout) => {
                let guard = tick_cancel.clone();
                match tokio::time::timeout(timeout, self.enqueue(&tick_cancel)).await {
                    Ok(result) => result,
                    Err(_) => {
                        guard.cancel();
                        Err(EngineError::from(ingest_api::PluginError::cancelled()))
                    }
                }
            }
            None => self.enqueue(&tick_cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker::MemoryBroker;
    use ingest_api::{MetricFamily, Object, PluginError, Reference};
    use std::sync::Mutex;

    struct FakeSource {
        items: Mutex<Vec<Reference>>,
        reset_count: Mutex<usize>,
    }

    impl FakeSource {
        fn new(items: Vec<Reference>) -> Self {
            Self { items: Mutex::new(items), reset_count: Mutex::new(0) }
        }
    }

    #[async_trait]
    impl Source for FakeSource {
        async fn reset(&self, cancel: &CancellationToken) -> Result<(), PluginError> {
            if cancel.is_cancelled() {
                return Err(PluginError::cancelled());
            }
            *self.reset_count.lock().unwrap() += 1;
            Ok(())
        }

        async fn next(&self, cancel: &CancellationToken) -> Result<Reference, PluginError> {
            if cancel.is_cancelled() {
                return Err(PluginError::cancelled());
            }
            let mut items = self.items.lock().unwrap();
            if items.is_empty() {
                Err(PluginError::eof())
            } else {
                Ok(items.remove(0))
            }
        }

        async fn download(&self, _reference: &Reference, _cancel: &CancellationToken) -> Result<Object, PluginError> {
            unimplemented!("not exercised by enqueuer tests")
        }

        async fn cleanup(&self, _reference: &Reference, _cancel: &CancellationToken) -> Result<(), PluginError> {
            Ok(())
        }

        async fn gather(&self) -> Result<Vec<MetricFamily>, PluginError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn enqueue_drains_source_into_broker_and_stops_on_eof() {
        let broker = Arc::new(MemoryBroker::default());
        broker.declare_stream("stream-a").await;
        let source = Arc::new(FakeSource::new(vec![Reference::new("a", "a.bin"), Reference::new("b", "b.bin")]));
        let enqueuer = Enqueuer::new(source, broker.clone(), "subj.wf", CounterRegistry::new());

        enqueuer.enqueue(&CancellationToken::new()).await.unwrap();

        let mut sub = broker.pull_subscribe("subj.wf", "cons", "stream-a").await.unwrap();
        let msgs = sub.pop(Duration::from_millis(50), 10).await.unwrap();
        assert_eq!(msgs.len(), 2);
        let refs: Vec<Reference> = msgs.iter().map(|m| codec::unmarshal(m.data()).unwrap()).collect();
        assert_eq!(refs, vec![Reference::new("a", "a.bin"), Reference::new("b", "b.bin")]);
    }

    #[tokio::test]
    async fn enqueue_counts_attempts() {
        let broker = Arc::new(MemoryBroker::default());
        broker.declare_stream("stream-a").await;
        let source = Arc::new(FakeSource::new(vec![]));
        let metrics = CounterRegistry::new();
        let enqueuer = Enqueuer::new(source, broker, "subj.wf", metrics.clone());

        enqueuer.enqueue(&CancellationToken::new()).await.unwrap();
        enqueuer.enqueue(&CancellationToken::new()).await.unwrap();

        let families = metrics.gather();
        let success = families.iter().find(|f| f.labels.get("result").map(String::as_str) == Some("success")).unwrap();
        assert_eq!(success.value, 2.0);
    }

    #[tokio::test]
    async fn enqueue_is_cancelled_immediately_when_token_already_fired() {
        let broker = Arc::new(MemoryBroker::default());
        broker.declare_stream("stream-a").await;
        let source = Arc::new(FakeSource::new(vec![Reference::new("a", "a.bin")]));
        let enqueuer = Enqueuer::new(source.clone(), broker, "subj.wf", CounterRegistry::new());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = enqueuer.enqueue(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancel"), "expected a cancellation error, got: {err}");
        assert_eq!(*source.reset_count.lock().unwrap(), 0, "reset must not run once the token has fired");
    }

    #[tokio::test]
    async fn run_exits_without_a_further_tick_once_cancelled() {
        let broker = Arc::new(MemoryBroker::default());
        broker.declare_stream("stream-a").await;
        let source = Arc::new(FakeSource::new(vec![]));
        let enqueuer = Enqueuer::new(source, broker, "subj.wf", CounterRegistry::new());

        let cancel = CancellationToken::new();
        cancel.cancel();
        // interval > 0 so `run` takes the ticker path; with the token already
        // fired it must return after the first tick instead of looping forever.
        tokio::time::timeout(Duration::from_millis(200), enqueuer.run(Duration::from_secs(60), cancel))
            .await
            .expect("run must exit promptly once cancelled");
    }
}
