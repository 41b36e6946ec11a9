//! Reference destination plugin: stores objects under a flat directory
//! and, when a `meta` prefix is configured, backs existence checks with
//! a zero-byte done-marker sentinel (`spec.md` §4.5, "Optional
//! done-marker protocol"). Stands in for the cloud object-storage
//! clients the spec places out of scope — a test/demo fixture.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ingest_api::{CounterRegistry, ErrorKind, PluginError};
use plugin_rpc::{PluginHost, WireError};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

struct State {
    root: Option<PathBuf>,
    meta_prefix: Option<PathBuf>,
    metrics: CounterRegistry,
}

impl State {
    fn new() -> Self {
        Self { root: None, meta_prefix: None, metrics: CounterRegistry::new() }
    }

    fn require_configured(&self) -> Result<&PathBuf, PluginError> {
        self.root.as_ref().ok_or_else(PluginError::not_configured)
    }

    fn marker_path(&self, name: &str) -> Option<PathBuf> {
        self.meta_prefix.as_ref().map(|prefix| prefix.join(format!("{name}.done")))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let conn = match PluginHost::announce_and_accept().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "destination-fs: handshake failed");
            std::process::exit(1);
        }
    };
    let conn = std::sync::Arc::new(conn);
    let state = Mutex::new(State::new());

    while let Some((id, method, params)) = conn.recv_request().await {
        let result = dispatch(&conn, &state, &method, params).await;
        let wire_result = result.map_err(|e: PluginError| WireError::from_plugin_error(&e));
        if conn.respond(id, wire_result).await.is_err() {
            return;
        }
    }
}

async fn dispatch(
    conn: &std::sync::Arc<plugin_rpc::Connection>,
    state: &Mutex<State>,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, PluginError> {
    match method {
        "Configure" => {
            let config: BTreeMap<String, String> = serde_json::from_value(params)?;
            let root = config.get("root").ok_or_else(|| PluginError::config("destination-fs: missing 'root' config key"))?;
            let mut guard = state.lock().await;
            guard.root = Some(PathBuf::from(root));
            guard.meta_prefix = config.get("meta").map(PathBuf::from);
            Ok(json!({}))
        }
        "Stat" => {
            let reference = ingest_api::codec::from_value(params["reference"].clone())?;

            let guard = state.lock().await;
            let root = guard.require_configured()?.clone();
            let marker = guard.marker_path(&reference.name);
            drop(guard);

            let payload_path = root.join(&reference.name);
            let payload_exists = tokio::fs::try_exists(&payload_path).await.map_err(PluginError::from)?;

            match &marker {
                None => {
                    if payload_exists {
                        Ok(json!({ "uri": file_uri(&payload_path) }))
                    } else {
                        Err(PluginError::not_exist())
                    }
                }
                Some(marker_path) => {
                    if !payload_exists {
                        return Err(PluginError::not_exist());
                    }
                    let marker_exists = tokio::fs::try_exists(marker_path).await.map_err(PluginError::from)?;
                    if !marker_exists {
                        // Payload landed but the upload wasn't marked
                        // complete — back-fill the marker before
                        // reporting existence (`spec.md` §4.5).
                        write_marker(marker_path).await?;
                    }
                    Ok(json!({ "uri": file_uri(&payload_path) }))
                }
            }
        }
        "Store" => {
            #[derive(serde::Deserialize)]
            struct StoreParams {
                reference: serde_json::Value,
                #[allow(dead_code)]
                mime_type: String,
                length: u64,
                stream_id: u64,
            }
            let p: StoreParams = serde_json::from_value(params)?;
            let reference = ingest_api::codec::from_value(p.reference)?;

            let guard = state.lock().await;
            let root = guard.require_configured()?.clone();
            let marker = guard.marker_path(&reference.name);
            drop(guard);

            let mut reader = conn.register_inbound_stream(p.stream_id).await;
            let path = root.join(&reference.name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(PluginError::from)?;
            }
            let mut file = tokio::fs::File::create(&path).await.map_err(PluginError::from)?;
            let written = tokio::io::copy(&mut reader, &mut file).await.map_err(PluginError::from)?;
            file.flush().await.map_err(PluginError::from)?;

            if written != p.length {
                return Err(PluginError::new(
                    ErrorKind::Io,
                    format!("destination-fs: truncated upload for '{}': expected {} bytes, wrote {written}", reference.name, p.length),
                ));
            }

            if let Some(marker_path) = &marker {
                write_marker(marker_path).await?;
            }

            {
                let guard = state.lock().await;
                guard.metrics.inc("storage_operations_total", &[("operation", "store"), ("result", "success")]);
            }

            Ok(json!({ "url": file_uri(&path) }))
        }
        "Gather" => {
            let guard = state.lock().await;
            Ok(serde_json::to_value(guard.metrics.gather())?)
        }
        other => Err(PluginError::new(ErrorKind::NotImplemented, format!("destination-fs: unknown method '{other}'"))),
    }
}

async fn write_marker(path: &std::path::Path) -> Result<(), PluginError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(PluginError::from)?;
    }
    tokio::fs::File::create(path).await.map_err(PluginError::from)?;
    Ok(())
}

fn file_uri(path: &std::path::Path) -> String {
    format!("file://{}", path.display())
}
