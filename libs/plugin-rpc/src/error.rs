use ingest_api::{ErrorKind, PluginError};

/// Errors from the transport layer itself — framing, handshake, and TLS
/// failures — distinct from a plugin's own business errors, which are
/// decoded off the wire straight into a [`PluginError`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("handshake: {0}")]
    Handshake(String),

    #[error("tls: {0}")]
    Tls(String),

    #[error("connection closed")]
    Closed,

    #[error("call timed out")]
    Timeout,
}

impl From<TransportError> for PluginError {
    fn from(e: TransportError) -> Self {
        match &e {
            TransportError::Closed => PluginError::new(ErrorKind::Cancelled, e.to_string()),
            _ => PluginError::io(e.to_string()),
        }
    }
}
