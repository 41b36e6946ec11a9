use std::sync::Arc;
use std::time::Duration;

use broker::{Message, Subscription};
use futures_util::future::join_all;
use ingest_api::{codec, CounterRegistry, Destination, OnError, Source};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Pull batches from a subscription and run bounded-concurrency
/// per-message processing: stat, download, store, cleanup, ack,
/// webhook (`spec.md` §4.8).
pub struct Dequeuer {
    source: Arc<dyn Source>,
    destination: Arc<dyn Destination>,
    subscription: tokio::sync::Mutex<Box<dyn Subscription>>,
    batch_size: usize,
    concurrency: usize,
    cleanup: bool,
    webhook: Option<String>,
    on_error: OnError,
    metrics: CounterRegistry,
    http: reqwest::Client,
}

const POP_BUDGET: Duration = Duration::from_secs(5 * 60);

impl Dequeuer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn Source>,
        destination: Arc<dyn Destination>,
        subscription: Box<dyn Subscription>,
        batch_size: usize,
        concurrency: usize,
        cleanup: bool,
        webhook: Option<String>,
        on_error: OnError,
        metrics: CounterRegistry,
    ) -> Self {
        Self {
            source,
            destination,
            subscription: tokio::sync::Mutex::new(subscription),
            batch_size,
            concurrency,
            cleanup,
            webhook,
            on_error,
            metrics,
            http: reqwest::Client::new(),
        }
    }

    /// Outer loop: pop a batch, process it with bounded concurrency,
    /// POST the webhook, repeat. Returns when `cancel` fires, closing
    /// the subscription first.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                let _ = self.subscription.lock().await.close().await;
                return;
            }

            let popped = {
                let mut sub = self.subscription.lock().await;
                tokio::select! {
                    result = sub.pop(POP_BUDGET, self.batch_size) => result,
                    _ = cancel.cancelled() => {
                        let _ = sub.close().await;
                        return;
                    }
                }
            };

            let msgs = match popped {
                Ok(msgs) => msgs,
                Err(e) => {
                    tracing::warn!(error = %e, "broker pop failed, retrying");
                    continue;
                }
            };

            if msgs.is_empty() {
                continue;
            }

            let urls = self.process_batch(msgs, &cancel).await;

            if let Some(url) = &self.webhook
                && !urls.is_empty()
            {
                self.post_webhook(url, &urls).await;
            }
        }
    }

    /// Runs the whole batch under `cancel`: each in-flight message's
    /// plugin calls race the token (via their own `call_typed` select),
    /// so a cancellation mid-batch unblocks every worker instead of
    /// only being checked at the next `pop`.
    async fn process_batch(&self, msgs: Vec<Box<dyn Message>>, cancel: &CancellationToken) -> Vec<String> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let tasks = msgs.into_iter().map(|msg| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                self.process_one(msg, cancel).await
            }
        });
        join_all(tasks).await.into_iter().flatten().collect()
    }

    /// One message to terminal outcome: decode, `process`, then ack
    /// (unless decode failed, in which case the message is left
    /// unacked for redelivery).
    async fn process_one(&self, msg: Box<dyn Message>, cancel: &CancellationToken) -> Option<String> {
        let reference = match codec::unmarshal(msg.data()) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode reference, leaving unacked");
                self.metrics.inc("dequeue_attempts_total", &[("result", "decode_error")]);
                return None;
            }
        };

        let result = self.process(&reference, cancel).await;
        self.metrics.inc("dequeue_attempts_total", &[("result", if result.is_ok() { "success" } else { "error" })]);

        let url = match &result {
            Ok(url) => url.clone(),
            Err(_) => None,
        };

        match self.on_error {
            OnError::Ack => {
                if let Err(e) = msg.ack_sync().await {
                    tracing::warn!(error = %e, "ack failed, broker will redeliver");
                }
            }
            OnError::Nak if result.is_err() => {
                if let Err(e) = msg.nak().await {
                    tracing::warn!(error = %e, "nak failed");
                }
            }
            OnError::Nak => {
                if let Err(e) = msg.ack_sync().await {
                    tracing::warn!(error = %e, "ack failed, broker will redeliver");
                }
            }
        }

        url
    }

    /// The per-reference state machine from `spec.md` §4.8: stat →
    /// (skip or download+store) → optional cleanup. Returns the stored
    /// URL on success, `None` if the object already existed (no URL to
    /// report to the webhook for a skipped reference).
    async fn process(&self, reference: &ingest_api::Reference, cancel: &CancellationToken) -> Result<Option<String>, ()> {
        match self.destination.stat(reference, cancel).await {
            Ok(_) => {
                if self.cleanup {
                    // Diagram has no FAIL edge out of the already-exists
                    // branch; a cleanup error here is logged, not fatal.
                    let _ = self.run_cleanup(reference, cancel).await;
                }
                Ok(None)
            }
            Err(e) if e.is_not_exist() => {
                self.metrics.inc("storage_operations_total", &[("operation", "stat"), ("result", "not_exist")]);

                let object = match self.source.download(reference, cancel).await {
                    Ok(obj) => {
                        self.metrics.inc("client_operations_total", &[("operation", "download"), ("result", "success")]);
                        obj
                    }
                    Err(e) => {
                        tracing::warn!(reference = %reference.id, error = %e, "download failed");
                        self.metrics.inc("client_operations_total", &[("operation", "download"), ("result", "error")]);
                        return Err(());
                    }
                };

                let url = match self.destination.store(reference, object, cancel).await {
                    Ok(url) => {
                        self.metrics.inc("storage_operations_total", &[("operation", "store"), ("result", "success")]);
                        url
                    }
                    Err(e) => {
                        tracing::warn!(reference = %reference.id, error = %e, "store failed");
                        self.metrics.inc("storage_operations_total", &[("operation", "store"), ("result", "error")]);
                        return Err(());
                    }
                };

                if self.cleanup && self.run_cleanup(reference, cancel).await.is_err() {
                    return Err(());
                }
                Ok(Some(url))
            }
            Err(e) => {
                tracing::warn!(reference = %reference.id, error = %e, "stat failed");
                self.metrics.inc("storage_operations_total", &[("operation", "stat"), ("result", "error")]);
                Err(())
            }
        }
    }

    async fn run_cleanup(&self, reference: &ingest_api::Reference, cancel: &CancellationToken) -> Result<(), ()> {
        match self.source.cleanup(reference, cancel).await {
            Ok(()) => {
                self.metrics.inc("client_operations_total", &[("operation", "cleanup"), ("result", "success")]);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(reference = %reference.id, error = %e, "cleanup failed");
                self.metrics.inc("client_operations_total", &[("operation", "cleanup"), ("result", "error")]);
                Err(())
            }
        }
    }

    async fn post_webhook(&self, url: &str, urls: &[String]) {
        match self.http.post(url).json(urls).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.metrics.inc("webhook_http_client_requests_total", &[("result", "success")]);
            }
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "webhook returned non-2xx");
                self.metrics.inc("webhook_http_client_requests_total", &[("result", "error")]);
            }
            Err(e) => {
                tracing::warn!(error = %e, "webhook request failed");
                self.metrics.inc("webhook_http_client_requests_total", &[("result", "error")]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker::MemoryBroker;
    use broker::Broker as BrokerTrait;
    use ingest_api::{MetricFamily, Object, ObjectInfo, PluginError, Reference};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeSource {
        cleanup_calls: StdMutex<Vec<String>>,
        in_flight_downloads: Arc<AtomicUsize>,
        max_in_flight_downloads: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                cleanup_calls: StdMutex::new(Vec::new()),
                in_flight_downloads: Arc::new(AtomicUsize::new(0)),
                max_in_flight_downloads: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Source for FakeSource {
        async fn reset(&self, _cancel: &CancellationToken) -> Result<(), PluginError> {
            Ok(())
        }

        async fn next(&self, _cancel: &CancellationToken) -> Result<Reference, PluginError> {
            Err(PluginError::eof())
        }

        async fn download(&self, reference: &Reference, _cancel: &CancellationToken) -> Result<Object, PluginError> {
            let inflight = self.in_flight_downloads.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight_downloads.fetch_max(inflight, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight_downloads.fetch_sub(1, Ordering::SeqCst);

            let bytes = format!("body-{}", reference.id).into_bytes();
            let reader: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>> = Box::pin(std::io::Cursor::new(bytes.clone()));
            Ok(Object::new("text/plain", bytes.len() as u64, reader))
        }

        async fn cleanup(&self, reference: &Reference, _cancel: &CancellationToken) -> Result<(), PluginError> {
            self.cleanup_calls.lock().unwrap().push(reference.id.clone());
            Ok(())
        }

        async fn gather(&self) -> Result<Vec<MetricFamily>, PluginError> {
            Ok(Vec::new())
        }
    }

    struct FakeDestination {
        existing: StdMutex<HashSet<String>>,
        store_calls: StdMutex<Vec<String>>,
    }

    impl FakeDestination {
        fn new(pre_existing: &[&str]) -> Self {
            Self {
                existing: StdMutex::new(pre_existing.iter().map(|s| s.to_string()).collect()),
                store_calls: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Destination for FakeDestination {
        async fn stat(&self, reference: &Reference, _cancel: &CancellationToken) -> Result<ObjectInfo, PluginError> {
            if self.existing.lock().unwrap().contains(&reference.id) {
                Ok(ObjectInfo::new(format!("fake://{}", reference.id)))
            } else {
                Err(PluginError::not_exist())
            }
        }

        async fn store(&self, reference: &Reference, mut object: Object, _cancel: &CancellationToken) -> Result<String, PluginError> {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            object.stream.read_to_end(&mut buf).await?;
            self.existing.lock().unwrap().insert(reference.id.clone());
            self.store_calls.lock().unwrap().push(reference.id.clone());
            Ok(format!("fake://{}", reference.id))
        }
    }

    async fn make_dequeuer(
        source: Arc<FakeSource>,
        destination: Arc<FakeDestination>,
        refs: &[Reference],
        batch_size: usize,
        concurrency: usize,
        cleanup: bool,
    ) -> (Dequeuer, CounterRegistry) {
        let broker = MemoryBroker::new();
        broker.declare_stream("STREAM").await;
        for r in refs {
            broker.publish("wf.a", codec::marshal(r).unwrap()).await.unwrap();
        }
        let sub = broker.pull_subscribe("wf.a", "cons", "STREAM").await.unwrap();
        let metrics = CounterRegistry::new();
        let dequeuer = Dequeuer::new(
            source,
            destination,
            sub,
            batch_size,
            concurrency,
            cleanup,
            None,
            OnError::Ack,
            metrics.clone(),
        );
        (dequeuer, metrics)
    }

    #[tokio::test]
    async fn s2_object_absent_downloads_stores_and_cleans_up() {
        let source = Arc::new(FakeSource::new());
        let destination = Arc::new(FakeDestination::new(&[]));
        let refs = vec![Reference::new("bar", "foo")];
        let (dequeuer, metrics) = make_dequeuer(source.clone(), destination.clone(), &refs, 8, 4, true).await;

        let mut sub = dequeuer.subscription.lock().await;
        let msgs = sub.pop(Duration::from_secs(1), 8).await.unwrap();
        drop(sub);

        let urls = dequeuer.process_batch(msgs, &CancellationToken::new()).await;
        assert_eq!(urls, vec!["fake://bar".to_string()]);
        assert_eq!(destination.store_calls.lock().unwrap().as_slice(), ["bar"]);
        assert_eq!(source.cleanup_calls.lock().unwrap().as_slice(), ["bar"]);

        let success = metrics.gather().into_iter().find(|f| f.name == "dequeue_attempts_total").unwrap();
        assert_eq!(success.value, 1.0);
    }

    #[tokio::test]
    async fn s3_object_already_exists_skips_download_and_store_but_still_cleans_up() {
        let source = Arc::new(FakeSource::new());
        let destination = Arc::new(FakeDestination::new(&["bar"]));
        let refs = vec![Reference::new("bar", "foo")];
        let (dequeuer, _metrics) = make_dequeuer(source.clone(), destination.clone(), &refs, 8, 4, true).await;

        let mut sub = dequeuer.subscription.lock().await;
        let msgs = sub.pop(Duration::from_secs(1), 8).await.unwrap();
        drop(sub);

        let urls = dequeuer.process_batch(msgs, &CancellationToken::new()).await;
        assert!(urls.is_empty(), "no url should be reported for a skipped (already-existing) reference");
        assert!(destination.store_calls.lock().unwrap().is_empty());
        assert_eq!(source.cleanup_calls.lock().unwrap().as_slice(), ["bar"]);
    }

    #[tokio::test]
    async fn idempotent_skip_on_second_process_of_same_reference() {
        let source = Arc::new(FakeSource::new());
        let destination = Arc::new(FakeDestination::new(&[]));
        let reference = Reference::new("bar", "foo");

        dequeuer_process_once(&source, &destination, &reference).await;
        dequeuer_process_once(&source, &destination, &reference).await;

        assert_eq!(destination.store_calls.lock().unwrap().len(), 1);
    }

    async fn dequeuer_process_once(source: &Arc<FakeSource>, destination: &Arc<FakeDestination>, reference: &Reference) {
        let (dequeuer, _metrics) = make_dequeuer(source.clone(), destination.clone(), &[], 8, 4, false).await;
        let _ = dequeuer.process(reference, &CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn concurrency_bound_limits_simultaneous_downloads() {
        let source = Arc::new(FakeSource::new());
        let destination = Arc::new(FakeDestination::new(&[]));
        let refs: Vec<Reference> = (0..6).map(|i| Reference::new(i.to_string(), format!("n{i}"))).collect();
        let (dequeuer, _metrics) = make_dequeuer(source.clone(), destination.clone(), &refs, 8, 2, false).await;

        let mut sub = dequeuer.subscription.lock().await;
        let msgs = sub.pop(Duration::from_secs(1), 8).await.unwrap();
        drop(sub);

        dequeuer.process_batch(msgs, &CancellationToken::new()).await;
        assert!(source.max_in_flight_downloads.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn decode_failure_reports_no_url_and_does_not_touch_source_or_destination() {
        let broker = MemoryBroker::new();
        broker.declare_stream("STREAM").await;
        broker.publish("wf.a", b"not json".to_vec()).await.unwrap();
        let sub = broker.pull_subscribe("wf.a", "cons", "STREAM").await.unwrap();

        let source = Arc::new(FakeSource::new());
        let destination = Arc::new(FakeDestination::new(&[]));
        let metrics = CounterRegistry::new();
        let dequeuer = Dequeuer::new(source.clone(), destination.clone(), sub, 8, 4, false, None, OnError::Ack, metrics.clone());

        let mut sub = dequeuer.subscription.lock().await;
        let msgs = sub.pop(Duration::from_secs(1), 8).await.unwrap();
        drop(sub);
        let urls = dequeuer.process_batch(msgs, &CancellationToken::new()).await;

        assert!(urls.is_empty());
        assert!(destination.store_calls.lock().unwrap().is_empty());
        assert!(source.cleanup_calls.lock().unwrap().is_empty());
        let decode_errors = metrics.gather().into_iter().find(|f| f.labels.get("result").map(String::as_str) == Some("decode_error"));
        assert_eq!(decode_errors.unwrap().value, 1.0);
    }

    #[tokio::test]
    async fn s7_end_to_end_two_references_two_destinations() {
        let broker = MemoryBroker::new();
        broker.declare_stream("STREAM").await;
        broker.publish("wf.a", codec::marshal(&Reference::new("1", "one")).unwrap()).await.unwrap();
        broker.publish("wf.a", codec::marshal(&Reference::new("2", "two")).unwrap()).await.unwrap();

        let source = Arc::new(FakeSource::new());
        let d0 = Arc::new(FakeDestination::new(&[]));
        let d1 = Arc::new(FakeDestination::new(&[]));
        let fanout: Arc<dyn Destination> = Arc::new(crate::fanout::FanOut::new(vec![d0.clone(), d1.clone()]));

        let sub = broker.pull_subscribe("wf.a", "cons", "STREAM").await.unwrap();
        let metrics = CounterRegistry::new();
        let dequeuer = Arc::new(Dequeuer::new(source, fanout, sub, 1, 1, false, None, OnError::Ack, metrics.clone()));

        let cancel = CancellationToken::new();
        let run_dequeuer = dequeuer.clone();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { run_dequeuer.run(run_cancel).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(d0.store_calls.lock().unwrap().len(), 2);
        assert_eq!(d1.store_calls.lock().unwrap().len(), 2);
        let success = metrics
            .gather()
            .into_iter()
            .find(|f| f.name == "dequeue_attempts_total" && f.labels.get("result").map(String::as_str) == Some("success"))
            .unwrap();
        assert_eq!(success.value, 2.0);
    }
}
