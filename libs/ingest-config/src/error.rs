/// Errors loading or validating the workflow YAML configuration
/// (`spec.md` §6).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading '{path}': {source}")]
    Read { path: String, source: std::io::Error },

    #[error("parsing '{path}': {source}")]
    Parse { path: String, source: serde_yaml::Error },

    #[error("validation: {0}")]
    Validation(String),
}
