#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config: {0}")]
    Config(#[from] ingest_config::ConfigError),

    #[error("broker: {0}")]
    Broker(#[from] broker::BrokerError),

    #[error("plugin manager: {0}")]
    Manager(#[from] plugin_manager::ManagerError),

    #[error("workflow runner: {0}")]
    Runner(#[from] workflow_runner::RunnerError),

    #[error("no plugin named '{0}' found in any --plugins directory")]
    PluginNotFound(String),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
