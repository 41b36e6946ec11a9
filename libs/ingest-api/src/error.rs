/// Category of a plugin-facing error.
///
/// The sentinels (`Eof`, `NotExist`, `NotConfigured`, `NotImplemented`,
/// `Cancelled`) are the small closed set transported across the plugin
/// RPC boundary (see `plugin-rpc`); `Config`/`Io`/`Format`/`Logic` stay
/// local to the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration — permanent, fail at startup.
    Config,
    /// I/O or network error — transient, may retry.
    Io,
    /// Data format/parse error — bad input, skip record.
    Format,
    /// A listing pass or stream ended normally.
    Eof,
    /// The probed object does not exist at the destination.
    NotExist,
    /// A plugin method was called before `Configure`.
    NotConfigured,
    /// The plugin does not implement this optional method.
    NotImplemented,
    /// The caller's context was cancelled.
    Cancelled,
    /// Logical error (invalid state, generic failure).
    Logic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Format => "format",
            ErrorKind::Eof => "eof",
            ErrorKind::NotExist => "not_exist",
            ErrorKind::NotConfigured => "not_configured",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Logic => "logic",
        };
        f.write_str(s)
    }
}

/// Unified error type for source/destination plugin operations and the
/// host code that drives them.
///
/// Carries an [`ErrorKind`] for categorization and a human-readable
/// message. `From` impls assign the appropriate kind so `?` stays
/// ergonomic in both plugin and host code.
#[derive(Clone)]
pub struct PluginError {
    kind: ErrorKind,
    message: String,
}

impl PluginError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn format_err(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, msg)
    }

    pub fn eof() -> Self {
        Self::new(ErrorKind::Eof, "EOF")
    }

    pub fn not_exist() -> Self {
        Self::new(ErrorKind::NotExist, "not exist")
    }

    pub fn not_configured() -> Self {
        Self::new(ErrorKind::NotConfigured, "not configured")
    }

    pub fn not_implemented() -> Self {
        Self::new(ErrorKind::NotImplemented, "not implemented")
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "context cancelled")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_eof(&self) -> bool {
        self.kind == ErrorKind::Eof
    }

    pub fn is_not_exist(&self) -> bool {
        self.kind == ErrorKind::NotExist
    }
}

impl std::fmt::Debug for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PluginError {}

impl From<String> for PluginError {
    fn from(s: String) -> Self {
        Self::new(ErrorKind::Logic, s)
    }
}

impl From<&str> for PluginError {
    fn from(s: &str) -> Self {
        Self::new(ErrorKind::Logic, s.to_string())
    }
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Self::not_exist()
        } else {
            Self::new(ErrorKind::Io, e.to_string())
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Format, e.to_string())
    }
}
