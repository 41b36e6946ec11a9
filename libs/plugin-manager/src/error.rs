/// Errors from spawning, configuring, or supervising a plugin — distinct
/// from a [`ingest_api::PluginError`] returned by a single plugin
/// method call, which propagates as-is.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("plugin '{0}' not found in any configured plugin directory")]
    NotFound(String),

    #[error("plugin: {0}")]
    Plugin(#[from] ingest_api::PluginError),

    #[error("liveness check failed for {label}: {source}")]
    Liveness { label: String, source: ingest_api::PluginError },
}
