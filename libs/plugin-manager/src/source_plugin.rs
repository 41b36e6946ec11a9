use std::pin::Pin;

use async_trait::async_trait;
use ingest_api::{codec, MetricFamily, Object, PluginError, Reference, Source};
use plugin_rpc::PluginProcess;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// A source plugin reached over the out-of-process RPC channel. Thin
/// translation layer: each `Source` method is one typed round-trip
/// (`spec.md` §4.3's "Callable methods exposed by a source plugin").
pub struct SourcePlugin {
    process: PluginProcess,
}

impl SourcePlugin {
    pub(crate) fn new(process: PluginProcess) -> Self {
        Self { process }
    }

    pub(crate) async fn configure(&self, config: &std::collections::BTreeMap<String, String>) -> Result<(), PluginError> {
        self.process.conn.call_typed("Configure", serde_json::json!(config), &CancellationToken::new()).await?;
        Ok(())
    }

    pub(crate) async fn ping(&self) -> Result<(), PluginError> {
        self.process.conn.ping().await.map_err(Into::into)
    }

    pub(crate) async fn kill(&self) {
        self.process.kill().await;
    }
}

#[async_trait]
impl Source for SourcePlugin {
    async fn reset(&self, cancel: &CancellationToken) -> Result<(), PluginError> {
        self.process.conn.call_typed("Reset", serde_json::json!({}), cancel).await?;
        Ok(())
    }

    async fn next(&self, cancel: &CancellationToken) -> Result<Reference, PluginError> {
        let value = self.process.conn.call_typed("Next", serde_json::json!({}), cancel).await?;
        codec::from_value(value)
    }

    async fn download(&self, reference: &Reference, cancel: &CancellationToken) -> Result<Object, PluginError> {
        #[derive(serde::Deserialize)]
        struct ObjectHeader {
            mime_type: String,
            length: u64,
            stream_id: u64,
        }

        let header: ObjectHeader = serde_json::from_value(
            self.process
                .conn
                .call_typed("Download", serde_json::json!({ "reference": codec::to_value(reference) }), cancel)
                .await?,
        )?;
        let reader = self.process.conn.register_inbound_stream(header.stream_id).await;
        let stream: Pin<Box<dyn AsyncRead + Send>> = Box::pin(reader);
        Ok(Object::new(header.mime_type, header.length, stream))
    }

    async fn cleanup(&self, reference: &Reference, cancel: &CancellationToken) -> Result<(), PluginError> {
        self.process
            .conn
            .call_typed("CleanUp", serde_json::json!({ "reference": codec::to_value(reference) }), cancel)
            .await?;
        Ok(())
    }

    async fn gather(&self) -> Result<Vec<MetricFamily>, PluginError> {
        let value = self.process.conn.call_typed("Gather", serde_json::json!({}), &CancellationToken::new()).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }
}
