/// Errors from wiring a workflow into a running enqueuer/dequeuer —
/// distinct from [`ingest_engine::EngineError`], which this wraps
/// rather than replaces.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("workflow '{workflow}': source '{name}' is not a configured source binding")]
    UnknownSource { workflow: String, name: String },

    #[error("workflow '{workflow}': destination '{name}' is not a configured destination binding")]
    UnknownDestination { workflow: String, name: String },

    #[error("broker: {0}")]
    Broker(#[from] broker::BrokerError),
}
