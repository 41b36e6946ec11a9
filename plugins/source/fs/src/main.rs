//! Reference source plugin: lists files in a flat directory and serves
//! their bytes (`spec.md` §4.5, "Source contract"). Stands in for the
//! cloud-listing adapters the spec places out of scope — a test/demo
//! fixture, not a production client.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ingest_api::{CounterRegistry, ErrorKind, PluginError};
use plugin_rpc::{Connection, PluginHost, WireError};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

/// `Reset`able cursor over one flat-directory listing pass.
struct Listing {
    entries: Vec<String>,
    cursor: usize,
}

struct State {
    root: Option<PathBuf>,
    listing: Option<Listing>,
    metrics: CounterRegistry,
}

impl State {
    fn new() -> Self {
        Self { root: None, listing: None, metrics: CounterRegistry::new() }
    }

    fn require_configured(&self) -> Result<&PathBuf, PluginError> {
        self.root.as_ref().ok_or_else(PluginError::not_configured)
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
            tracing::error!(error = %e, "source-fs: handshake failed");
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
    conn: &std::sync::Arc<Connection>,
    state: &Mutex<State>,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, PluginError> {
    match method {
        "Configure" => {
            let config: BTreeMap<String, String> = serde_json::from_value(params)?;
            let root = config.get("root").ok_or_else(|| PluginError::config("source-fs: missing 'root' config key"))?;
            let mut guard = state.lock().await;
            guard.root = Some(PathBuf::from(root));
            guard.listing = None;
            Ok(json!({}))
        }
        "Reset" => {
            let mut guard = state.lock().await;
            let root = guard.require_configured()?.clone();
            let entries = list_dir(&root)?;
            guard.listing = Some(Listing { entries, cursor: 0 });
            Ok(json!({}))
        }
        "Next" => {
            let mut guard = state.lock().await;
            guard.require_configured()?;
            let listing = guard.listing.as_mut().ok_or_else(|| PluginError::config("source-fs: Next called before Reset"))?;
            if listing.cursor >= listing.entries.len() {
                return Err(PluginError::eof());
            }
            let name = listing.entries[listing.cursor].clone();
            listing.cursor += 1;
            Ok(ingest_api::codec::to_value(&ingest_api::Reference::new(name.clone(), name)))
        }
        "Download" => {
            let guard = state.lock().await;
            let root = guard.require_configured()?.clone();
            drop(guard);

            let reference = ingest_api::codec::from_value(params["reference"].clone())?;
            let path = root.join(&reference.name);
            let mut file = tokio::fs::File::open(&path).await.map_err(PluginError::from)?;
            let length = file.metadata().await.map_err(PluginError::from)?.len();
            let mime_type = mime_for(&path);

            let (stream_id, tx) = conn.open_outbound_stream();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match file.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "source-fs: read failed mid-stream");
                            break;
                        }
                    }
                }
            });

            {
                let guard = state.lock().await;
                guard.metrics.inc("client_operations_total", &[("operation", "download"), ("result", "success")]);
            }

            Ok(json!({ "mime_type": mime_type, "length": length, "stream_id": stream_id }))
        }
        "CleanUp" => {
            let guard = state.lock().await;
            let root = guard.require_configured()?.clone();
            drop(guard);

            let reference = ingest_api::codec::from_value(params["reference"].clone())?;
            let path = root.join(&reference.name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(json!({})),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(json!({})),
                Err(e) => Err(PluginError::new(ErrorKind::Io, format!("remove {}: {e}", path.display()))),
            }
        }
        "Gather" => {
            let guard = state.lock().await;
            Ok(serde_json::to_value(guard.metrics.gather())?)
        }
        other => Err(PluginError::new(ErrorKind::NotImplemented, format!("source-fs: unknown method '{other}'"))),
    }
}

fn list_dir(root: &std::path::Path) -> Result<Vec<String>, PluginError> {
    let dir = std::fs::read_dir(root).map_err(|e| PluginError::new(ErrorKind::Io, format!("read_dir {}: {e}", root.display())))?;
    let mut names = Vec::new();
    for entry in dir {
        let entry = entry.map_err(|e| PluginError::new(ErrorKind::Io, format!("read_dir entry: {e}")))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn mime_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        _ => "application/octet-stream",
    }
}
