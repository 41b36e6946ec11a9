use async_trait::async_trait;
use ingest_api::{CounterRegistry, Destination, MetricFamily, Object, ObjectInfo, PluginError, Reference};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Wraps a [`Destination`] with per-destination `storage_operations_total`
/// counters, labeled by `name` in addition to the dequeuer's own
/// `operation`/`result` labels (`spec.md` §4.9: "wrapping each with a
/// metrics decorator, and wrapping the fan-out itself with a metrics
/// decorator when `|destinations| > 1`").
pub struct MetricsDestination {
    name: String,
    inner: Arc<dyn Destination>,
    metrics: CounterRegistry,
}

impl MetricsDestination {
    pub fn new(name: impl Into<String>, inner: Arc<dyn Destination>, metrics: CounterRegistry) -> Self {
        Self { name: name.into(), inner, metrics }
    }

    fn record(&self, operation: &str, result: &str) {
        self.metrics.inc("storage_operations_total", &[("operation", operation), ("result", result), ("name", &self.name)]);
    }
}

#[async_trait]
impl Destination for MetricsDestination {
    async fn stat(&self, reference: &Reference, cancel: &CancellationToken) -> Result<ObjectInfo, PluginError> {
        match self.inner.stat(reference, cancel).await {
            Ok(info) => {
                self.record("stat", "success");
                Ok(info)
            }
            Err(e) if e.is_not_exist() => {
                self.record("stat", "not_exist");
                Err(e)
            }
            Err(e) => {
                self.record("stat", "error");
                Err(e)
            }
        }
    }

    async fn store(&self, reference: &Reference, object: Object, cancel: &CancellationToken) -> Result<String, PluginError> {
        match self.inner.store(reference, object, cancel).await {
            Ok(url) => {
                self.record("store", "success");
                Ok(url)
            }
            Err(e) => {
                self.record("store", "error");
                Err(e)
            }
        }
    }

    async fn gather(&self) -> Result<Vec<MetricFamily>, PluginError> {
        self.inner.gather().await
    }
}
