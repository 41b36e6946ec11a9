/// Errors from the engine's own loops (fan-out, enqueue, dequeue) —
/// distinct from a [`ingest_api::PluginError`] a plugin call returns,
/// which is wrapped here rather than replaced.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("plugin: {0}")]
    Plugin(#[from] ingest_api::PluginError),

    #[error("broker: {0}")]
    Broker(#[from] broker::BrokerError),

    #[error("fan-out: {0}")]
    FanOut(String),
}
