use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ingest_api::MetricFamily;
use plugin_rpc::PluginProcess;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::destination_plugin::DestinationPlugin;
use crate::error::ManagerError;
use crate::source_plugin::SourcePlugin;

/// Labels a plugin is identified by to operators: `{component, type,
/// name}` plus whichever workflow(s) reference it, attached to every
/// metric series the manager gathers from it (`spec.md` §9, "Metrics
/// aggregation across processes").
#[derive(Debug, Clone)]
pub struct PluginLabels {
    pub component: &'static str,
    pub plugin_type: String,
    pub name: String,
}

struct SourceEntry {
    handle: Arc<SourcePlugin>,
    labels: PluginLabels,
}

struct DestinationEntry {
    handle: Arc<DestinationPlugin>,
    labels: PluginLabels,
}

/// Resolve the first directory in `search_dirs` containing an
/// executable file named `plugin_type` (`spec.md` §6, "Plugin
/// discovery").
pub fn resolve_plugin_path(search_dirs: &[PathBuf], plugin_type: &str) -> Option<PathBuf> {
    search_dirs.iter().map(|dir| dir.join(plugin_type)).find(|candidate| candidate.is_file())
}

/// Owns the lifecycle of every spawned plugin: starts and configures
/// them, tracks them in two ordered lists guarded by a single mutex,
/// watches their liveness, and aggregates their telemetry (`spec.md`
/// §4.4).
#[derive(Clone, Default)]
pub struct PluginManager {
    sources: Arc<Mutex<Vec<SourceEntry>>>,
    destinations: Arc<Mutex<Vec<DestinationEntry>>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn, handshake, and configure a source plugin. On any failure
    /// the child is killed before the error is returned; the manager's
    /// state is untouched.
    pub async fn new_source(
        &self,
        path: &Path,
        config: BTreeMap<String, String>,
        labels: PluginLabels,
    ) -> Result<Arc<SourcePlugin>, ManagerError> {
        let process = PluginProcess::spawn(path).await?;
        let plugin = SourcePlugin::new(process);
        if let Err(e) = plugin.configure(&config).await {
            plugin.kill().await;
            return Err(e.into());
        }
        let handle = Arc::new(plugin);
        self.sources.lock().await.push(SourceEntry { handle: handle.clone(), labels });
        Ok(handle)
    }

    /// Spawn, handshake, and configure a destination plugin.
    pub async fn new_destination(
        &self,
        path: &Path,
        config: BTreeMap<String, String>,
        labels: PluginLabels,
    ) -> Result<Arc<DestinationPlugin>, ManagerError> {
        let process = PluginProcess::spawn(path).await?;
        let plugin = DestinationPlugin::new(process);
        if let Err(e) = plugin.configure(&config).await {
            plugin.kill().await;
            return Err(e.into());
        }
        let handle = Arc::new(plugin);
        self.destinations.lock().await.push(DestinationEntry { handle: handle.clone(), labels });
        Ok(handle)
    }

    /// Ping every live plugin every `interval`; return the first
    /// failure encountered (the caller shuts the process down on this).
    /// Exits cleanly (`Ok(())`) if `cancel` fires first.
    pub async fn watch(&self, interval: Duration, cancel: CancellationToken) -> Result<(), ManagerError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let sources = self.sources.lock().await;
            for entry in sources.iter() {
                if let Err(e) = entry.handle.ping().await {
                    return Err(ManagerError::Liveness { label: entry.labels.name.clone(), source: e });
                }
            }
            drop(sources);

            let destinations = self.destinations.lock().await;
            for entry in destinations.iter() {
                if let Err(e) = entry.handle.ping().await {
                    return Err(ManagerError::Liveness { label: entry.labels.name.clone(), source: e });
                }
            }
        }
    }

    /// Concurrently call `Gather` on every plugin, tagging every
    /// returned series with `{component, type, name}`.
    pub async fn gather(&self) -> Vec<MetricFamily> {
        let sources = self.sources.lock().await;
        let destinations = self.destinations.lock().await;

        let source_futs = sources.iter().map(|entry| gather_one(entry.handle.as_ref(), &entry.labels));
        let dest_futs = destinations.iter().map(|entry| gather_one(entry.handle.as_ref(), &entry.labels));

        let mut out = Vec::new();
        for families in futures_util::future::join_all(source_futs).await {
            out.extend(families);
        }
        for families in futures_util::future::join_all(dest_futs).await {
            out.extend(families);
        }
        out
    }

    /// Best-effort parallel kill of every child; clears both lists.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let mut sources = self.sources.lock().await;
        futures_util::future::join_all(sources.iter().map(|e| e.handle.kill())).await;
        sources.clear();
        drop(sources);

        let mut destinations = self.destinations.lock().await;
        futures_util::future::join_all(destinations.iter().map(|e| e.handle.kill())).await;
        destinations.clear();
    }
}

async fn gather_one(
    handle: &(impl GatherableSource + ?Sized),
    labels: &PluginLabels,
) -> Vec<MetricFamily> {
    match handle.gather_families().await {
        Ok(families) => families
            .into_iter()
            .map(|f| {
                f.with_label("component", labels.component)
                    .with_label("type", labels.plugin_type.clone())
                    .with_label("name", labels.name.clone())
            })
            .collect(),
        Err(e) => {
            tracing::warn!(plugin = %labels.name, error = %e, "plugin gather failed");
            Vec::new()
        }
    }
}

#[async_trait::async_trait]
trait GatherableSource {
    async fn gather_families(&self) -> Result<Vec<MetricFamily>, ingest_api::PluginError>;
}

#[async_trait::async_trait]
impl GatherableSource for SourcePlugin {
    async fn gather_families(&self) -> Result<Vec<MetricFamily>, ingest_api::PluginError> {
        ingest_api::Source::gather(self).await
    }
}

#[async_trait::async_trait]
impl GatherableSource for DestinationPlugin {
    async fn gather_families(&self) -> Result<Vec<MetricFamily>, ingest_api::PluginError> {
        ingest_api::Destination::gather(self).await
    }
}

