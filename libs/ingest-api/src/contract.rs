use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::PluginError;
use crate::metrics::MetricFamily;
use crate::types::{Object, ObjectInfo, Reference};

// ════════════════════════════════════════════════════════════════
//  Source contract (C5)
// ════════════════════════════════════════════════════════════════

/// A single-consumer, restartable lazy sequence over an upstream
/// source's current listing, plus per-item download and cleanup.
///
/// `reset` must be called before the first `next` of any listing pass
/// and whenever the caller wants to restart; the contract forbids
/// calling `reset`/`next` concurrently with themselves — exactly one
/// Enqueuer owns a given source binding at runtime (see
/// `workflow-runner`).
#[async_trait]
pub trait Source: Send + Sync {
    /// (Re)start the lazy listing. `cancel` fires early with a
    /// `Cancelled`-kind error if the caller's deadline/shutdown
    /// preempts the round-trip (`spec.md` §4.3/§5).
    async fn reset(&self, cancel: &CancellationToken) -> Result<(), PluginError>;

    /// Produce the next reference in the current listing. Returns an
    /// `Eof`-kind error when the listing is exhausted; a further
    /// `next` without an intervening `reset` must keep returning EOF.
    async fn next(&self, cancel: &CancellationToken) -> Result<Reference, PluginError>;

    /// Fetch the object a reference points to. The caller must read
    /// the returned stream to completion exactly once.
    async fn download(&self, reference: &Reference, cancel: &CancellationToken) -> Result<Object, PluginError>;

    /// Idempotent removal of the source-side object. Must tolerate the
    /// object having already been removed.
    async fn cleanup(&self, reference: &Reference, cancel: &CancellationToken) -> Result<(), PluginError>;

    /// Plugin-reported telemetry.
    async fn gather(&self) -> Result<Vec<MetricFamily>, PluginError> {
        Ok(Vec::new())
    }
}

// ════════════════════════════════════════════════════════════════
//  Destination contract (C5)
// ════════════════════════════════════════════════════════════════

/// A stat-and-store destination.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Idempotent existence probe. Returns an `ObjectInfo` iff the
    /// object for this reference already exists; a `NotExist`-kind
    /// error otherwise (not an error condition — it means "proceed to
    /// store").
    async fn stat(&self, reference: &Reference, cancel: &CancellationToken) -> Result<ObjectInfo, PluginError>;

    /// Store a new object. Free to assume the bytes are new; must
    /// return a URL identifying the stored artifact.
    async fn store(&self, reference: &Reference, object: Object, cancel: &CancellationToken) -> Result<String, PluginError>;

    /// Plugin-reported telemetry.
    async fn gather(&self) -> Result<Vec<MetricFamily>, PluginError> {
        Ok(Vec::new())
    }
}
