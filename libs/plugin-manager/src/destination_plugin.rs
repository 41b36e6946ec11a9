use async_trait::async_trait;
use ingest_api::{codec, Destination, MetricFamily, Object, ObjectInfo, PluginError, Reference};
use plugin_rpc::PluginProcess;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// A destination plugin reached over the out-of-process RPC channel
/// (`spec.md` §4.3's "Callable methods exposed by a destination
/// plugin").
pub struct DestinationPlugin {
    process: PluginProcess,
}

impl DestinationPlugin {
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
impl Destination for DestinationPlugin {
    async fn stat(&self, reference: &Reference, cancel: &CancellationToken) -> Result<ObjectInfo, PluginError> {
        #[derive(serde::Deserialize)]
        struct StatResult {
            uri: String,
        }
        let value = self
            .process
            .conn
            .call_typed("Stat", serde_json::json!({ "reference": codec::to_value(reference) }), cancel)
            .await?;
        let result: StatResult = serde_json::from_value(value)?;
        Ok(ObjectInfo::new(result.uri))
    }

    async fn store(&self, reference: &Reference, mut object: Object, cancel: &CancellationToken) -> Result<String, PluginError> {
        let mime_type = object.mime_type.clone();
        let length = object.length;

        let conn = self.process.conn.clone();
        let (stream_id, tx) = conn.open_outbound_stream();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match object.stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        #[derive(serde::Deserialize)]
        struct StoreResult {
            url: String,
        }
        let params = serde_json::json!({
            "reference": codec::to_value(reference),
            "mime_type": mime_type,
            "length": length,
            "stream_id": stream_id,
        });
        let value = self.process.conn.call_typed("Store", params, cancel).await?;
        let result: StoreResult = serde_json::from_value(value)?;
        Ok(result.url)
    }

    async fn gather(&self) -> Result<Vec<MetricFamily>, PluginError> {
        let value = self.process.conn.call_typed("Gather", serde_json::json!({}), &CancellationToken::new()).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }
}
