use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use ingest_api::{CounterRegistry, MetricFamily};
use plugin_manager::PluginManager;
use tokio_util::sync::CancellationToken;

/// Internal HTTP endpoint: `/healthz` and `/metrics` (`spec.md` §6),
/// grounded on `libs/topic-api-server`'s axum router + graceful
/// shutdown.
#[derive(Clone)]
struct AppState {
    healthy: Arc<AtomicBool>,
    metrics: CounterRegistry,
    plugin_manager: PluginManager,
}

pub async fn run(
    listen: &str,
    healthy: Arc<AtomicBool>,
    metrics: CounterRegistry,
    plugin_manager: PluginManager,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let state = AppState { healthy, metrics, plugin_manager };

    let app = Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/metrics", get(handle_metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr(listen))
        .await
        .map_err(|e| format!("bind {listen}: {e}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))?;

    Ok(())
}

/// `:9090` (bare-port shorthand, `spec.md` §6's default) binds on all
/// interfaces; anything else is passed through unchanged.
fn bind_addr(listen: &str) -> String {
    match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen.to_string(),
    }
}

async fn handle_healthz(axum::extract::State(state): axum::extract::State<AppState>) -> impl IntoResponse {
    if state.healthy.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    }
}

async fn handle_metrics(axum::extract::State(state): axum::extract::State<AppState>) -> impl IntoResponse {
    let mut families = state.metrics.gather();
    families.extend(state.plugin_manager.gather().await);
    (StatusCode::OK, render_prometheus_text(&families))
}

fn render_prometheus_text(families: &[MetricFamily]) -> String {
    let mut out = String::new();
    for family in families {
        out.push_str(&family.name);
        if !family.labels.is_empty() {
            out.push('{');
            let mut first = true;
            for (key, value) in &family.labels {
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(key);
                out.push_str("=\"");
                out.push_str(&value.replace('\\', "\\\\").replace('"', "\\\""));
                out.push('"');
            }
            out.push('}');
        }
        out.push(' ');
        out.push_str(&family.value.to_string());
        out.push('\n');
    }
    out
}
