use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

// ════════════════════════════════════════════════════════════════
//  Reference
// ════════════════════════════════════════════════════════════════

/// The unit traversing the broker: a pointer to one item in a source's
/// current listing.
///
/// Two references with the same `id` must refer to the same logical
/// source item. `name` is used verbatim as the destination object key
/// suffix; `metadata` is opaque to the engine and only meaningful to
/// the source/destination plugins that produced/consume it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reference {
    pub id: String,
    pub name: String,
    pub metadata: Vec<u8>,
}

impl Reference {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into(), metadata: Vec::new() }
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }
}

// ════════════════════════════════════════════════════════════════
//  Object / ObjectInfo
// ════════════════════════════════════════════════════════════════

/// A streamable payload returned by `Source::download`.
///
/// The stream is single-pass: the caller must read it to completion
/// exactly once. `length` is the exact byte count, used by
/// destinations to detect truncated uploads.
pub struct Object {
    pub mime_type: String,
    pub length: u64,
    pub stream: Pin<Box<dyn AsyncRead + Send>>,
}

impl Object {
    pub fn new(mime_type: impl Into<String>, length: u64, stream: Pin<Box<dyn AsyncRead + Send>>) -> Self {
        Self { mime_type: mime_type.into(), length, stream }
    }
}

/// Existence record in a destination, returned by `Destination::stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub uri: String,
}

impl ObjectInfo {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

// ════════════════════════════════════════════════════════════════
//  Overflow / error policy shared by the ambient config layer
// ════════════════════════════════════════════════════════════════

/// What the dequeuer does with a reference whose `process` returned an
/// error: still ack (rely on the next enqueue pass to re-publish) or
/// nak (let the broker redeliver immediately). Resolves the "ack on
/// processing failure" open question — see `SPEC_FULL.md` §9.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Ack,
    Nak,
}

// ════════════════════════════════════════════════════════════════
//  Workflow
// ════════════════════════════════════════════════════════════════

/// Static configuration binding one source, a set of destinations, and
/// operational parameters. See `spec.md` §3 for the invariants.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub source: String,
    pub destinations: Vec<String>,
    pub batch_size: usize,
    pub concurrency: usize,
    pub interval: std::time::Duration,
    pub cleanup: bool,
    pub webhook: Option<String>,
    pub on_error: OnError,
}

impl Workflow {
    /// Validate the non-structural invariants `spec.md` §3 lists:
    /// non-empty destinations, positive batch size / concurrency.
    pub fn validate(&self) -> Result<(), String> {
        if self.destinations.is_empty() {
            return Err(format!("workflow '{}': destinations must be non-empty", self.name));
        }
        if self.batch_size == 0 {
            return Err(format!("workflow '{}': batch_size must be > 0", self.name));
        }
        if self.concurrency == 0 {
            return Err(format!("workflow '{}': concurrency must be > 0", self.name));
        }
        Ok(())
    }
}
