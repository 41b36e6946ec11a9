use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use broker::{Broker, MemoryBroker, MetricsBroker, NatsBroker};
use ingest_api::{CounterRegistry, Destination, Source};
use ingest_config::Config;
use plugin_manager::{resolve_plugin_path, PluginLabels, PluginManager};
use workflow_runner::{BrokerIds, WorkflowMode, WorkflowRunner};

use crate::cli::{Cli, Mode};
use crate::error::ServerError;

const PLUGIN_WATCH_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run(cli: Cli) -> Result<(), ServerError> {
    tracing::info!(config = %cli.config, "loading configuration");
    let config = Config::load(&cli.config)?;

    if cli.dry_run {
        tracing::info!("dry-run: configuration is valid");
        return Ok(());
    }

    let metrics = CounterRegistry::new();
    let plugin_manager = PluginManager::new();

    let sources = spawn_sources(&plugin_manager, &cli.plugin_dirs, &config.sources).await?;
    let destinations = spawn_destinations(&plugin_manager, &cli.plugin_dirs, &config.destinations).await?;
    let workflows = config.workflows();

    let ids = BrokerIds { stream: cli.stream.clone(), subject_prefix: cli.subject.clone(), consumer_prefix: cli.consumer.clone() };
    let mode = match cli.mode {
        Mode::Enqueue => WorkflowMode::Enqueue,
        Mode::Dequeue => WorkflowMode::Dequeue,
    };

    let broker = connect_broker(&cli, mode, &workflows, &ids, metrics.clone()).await?;

    let mut runner = WorkflowRunner::new(mode, broker.clone(), ids, metrics.clone());
    runner.start(&workflows, &sources, &destinations).await?;
    tracing::info!(mode = ?cli.mode, workflows = workflows.len(), "runner started");

    let healthy = Arc::new(AtomicBool::new(true));
    let shutdown = tokio_util::sync::CancellationToken::new();

    let http_handle = tokio::spawn({
        let listen = cli.listen.clone();
        let healthy = healthy.clone();
        let metrics = metrics.clone();
        let plugin_manager = plugin_manager.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = crate::http::run(&listen, healthy, metrics, plugin_manager, shutdown).await {
                tracing::error!(error = %e, "http server error");
            }
        }
    });
    tracing::info!(listen = %cli.listen, "internal http endpoint listening");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("ctrl-c received, shutting down");
        }
        result = plugin_manager.watch(PLUGIN_WATCH_INTERVAL, shutdown.clone()) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "plugin liveness check failed, shutting down");
            }
        }
    }

    healthy.store(false, Ordering::Relaxed);
    shutdown.cancel();
    runner.shutdown().await;
    plugin_manager.stop().await;
    let _ = broker.close(Duration::from_secs(5)).await;
    let _ = http_handle.await;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Connects and, for a real NATS broker, provisions the stream and (in
/// dequeue mode) every workflow's durable consumer up front — `spec.md`
/// §6's `stream-replicas`/`max-msgs` flags and §3's consumer binding.
/// The in-memory broker only needs the stream declared.
async fn connect_broker(
    cli: &Cli,
    mode: WorkflowMode,
    workflows: &[ingest_api::Workflow],
    ids: &BrokerIds,
    metrics: CounterRegistry,
) -> Result<Arc<dyn Broker>, ServerError> {
    if cli.queue_endpoint.starts_with("memory://") {
        let memory = MemoryBroker::new();
        memory.declare_stream(&cli.stream).await;
        Ok(Arc::new(MetricsBroker::new(memory, metrics)))
    } else {
        let nats = NatsBroker::connect(&cli.queue_endpoint).await?;
        nats.provision_stream(&cli.stream, cli.stream_replicas, cli.max_msgs).await?;
        if mode == WorkflowMode::Dequeue {
            for workflow in workflows {
                let subject = format!("{}.{}", ids.subject_prefix, workflow.name);
                let consumer = format!("{}__{}", ids.consumer_prefix, workflow.name);
                nats.provision_consumer(&ids.stream, &consumer, &subject).await?;
            }
        }
        Ok(Arc::new(MetricsBroker::new(nats, metrics)))
    }
}

async fn spawn_sources(
    plugin_manager: &PluginManager,
    plugin_dirs: &[std::path::PathBuf],
    bindings: &[ingest_config::PluginBinding],
) -> Result<HashMap<String, Arc<dyn Source>>, ServerError> {
    let mut out = HashMap::with_capacity(bindings.len());
    for binding in bindings {
        let path = resolve_plugin_path(plugin_dirs, &binding.plugin_type)
            .ok_or_else(|| ServerError::PluginNotFound(binding.plugin_type.clone()))?;
        let labels = PluginLabels { component: "source", plugin_type: binding.plugin_type.clone(), name: binding.name.clone() };
        let handle = plugin_manager.new_source(&path, binding.config(), labels).await?;
        out.insert(binding.name.clone(), handle as Arc<dyn Source>);
    }
    Ok(out)
}

async fn spawn_destinations(
    plugin_manager: &PluginManager,
    plugin_dirs: &[std::path::PathBuf],
    bindings: &[ingest_config::PluginBinding],
) -> Result<HashMap<String, Arc<dyn Destination>>, ServerError> {
    let mut out = HashMap::with_capacity(bindings.len());
    for binding in bindings {
        let path = resolve_plugin_path(plugin_dirs, &binding.plugin_type)
            .ok_or_else(|| ServerError::PluginNotFound(binding.plugin_type.clone()))?;
        let labels = PluginLabels { component: "destination", plugin_type: binding.plugin_type.clone(), name: binding.name.clone() };
        let handle = plugin_manager.new_destination(&path, binding.config(), labels).await?;
        out.insert(binding.name.clone(), handle as Arc<dyn Destination>);
    }
    Ok(out)
}
