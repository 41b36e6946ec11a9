use std::collections::HashMap;
use std::sync::Arc;

use broker::Broker;
use ingest_api::{CounterRegistry, Destination, Source, Workflow};
use ingest_engine::{Dequeuer, Enqueuer, FanOut, MetricsDestination};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;

/// Which half of the pipeline this process instance runs (`spec.md`
/// §4.9, the CLI's `--mode` flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowMode {
    Enqueue,
    Dequeue,
}

/// Broker identifiers a workflow's subject/consumer names are derived
/// from (`spec.md` §3: "Consumer binding").
#[derive(Debug, Clone)]
pub struct BrokerIds {
    pub stream: String,
    pub subject_prefix: String,
    pub consumer_prefix: String,
}

impl BrokerIds {
    fn subject(&self, workflow: &str) -> String {
        format!("{}.{}", self.subject_prefix, workflow)
    }

    fn consumer(&self, workflow: &str) -> String {
        format!("{}__{}", self.consumer_prefix, workflow)
    }
}

/// Wires a configured workflow into a running Enqueuer or Dequeuer,
/// owning its task and shutdown (`spec.md` §4.9).
///
/// `sources`/`destinations` are the already-instantiated plugin
/// bindings (one handle per unique name, shared across every workflow
/// that references it — `spec.md` §3). The runner does not load
/// plugins itself; that is the Plugin Manager's job.
pub struct WorkflowRunner {
    mode: WorkflowMode,
    broker: Arc<dyn Broker>,
    ids: BrokerIds,
    metrics: CounterRegistry,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkflowRunner {
    pub fn new(mode: WorkflowMode, broker: Arc<dyn Broker>, ids: BrokerIds, metrics: CounterRegistry) -> Self {
        Self { mode, broker, ids, metrics, cancel: CancellationToken::new(), handles: Vec::new() }
    }

    /// Spawn one task per configured workflow, in this runner's mode.
    /// `sources`/`destinations` must already contain every binding any
    /// workflow references (`Workflow::validate` only checks
    /// structure, not that the name resolves — this is where that
    /// invariant from `spec.md` §3 is enforced).
    pub async fn start(
        &mut self,
        workflows: &[Workflow],
        sources: &HashMap<String, Arc<dyn Source>>,
        destinations: &HashMap<String, Arc<dyn Destination>>,
    ) -> Result<(), RunnerError> {
        for workflow in workflows {
            match self.mode {
                WorkflowMode::Enqueue => self.start_enqueue(workflow, sources)?,
                WorkflowMode::Dequeue => self.start_dequeue(workflow, sources, destinations).await?,
            }
        }
        Ok(())
    }

    fn start_enqueue(&mut self, workflow: &Workflow, sources: &HashMap<String, Arc<dyn Source>>) -> Result<(), RunnerError> {
        let source = sources
            .get(&workflow.source)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownSource { workflow: workflow.name.clone(), name: workflow.source.clone() })?;

        let subject = self.ids.subject(&workflow.name);
        let enqueuer = Enqueuer::new(source, self.broker.clone(), subject, self.metrics.clone());
        let interval = workflow.interval;
        let cancel = self.cancel.clone();
        let name = workflow.name.clone();

        self.handles.push(tokio::spawn(async move {
            tracing::info!(workflow = %name, "enqueuer starting");
            enqueuer.run(interval, cancel).await;
            tracing::info!(workflow = %name, "enqueuer stopped");
        }));
        Ok(())
    }

    async fn start_dequeue(
        &mut self,
        workflow: &Workflow,
        sources: &HashMap<String, Arc<dyn Source>>,
        destinations: &HashMap<String, Arc<dyn Destination>>,
    ) -> Result<(), RunnerError> {
        let source = sources
            .get(&workflow.source)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownSource { workflow: workflow.name.clone(), name: workflow.source.clone() })?;

        let mut bound = Vec::with_capacity(workflow.destinations.len());
        for name in &workflow.destinations {
            let dest = destinations
                .get(name)
                .cloned()
                .ok_or_else(|| RunnerError::UnknownDestination { workflow: workflow.name.clone(), name: name.clone() })?;
            let decorated: Arc<dyn Destination> = Arc::new(MetricsDestination::new(name.clone(), dest, self.metrics.clone()));
            bound.push(decorated);
        }
        // A single destination needs no fan-out wrapper; `spec.md`
        // §4.9 only requires one when |destinations| > 1.
        let fan_out: Arc<dyn Destination> = if bound.len() == 1 {
            bound.into_iter().next().unwrap()
        } else {
            let fan_out: Arc<dyn Destination> = Arc::new(FanOut::new(bound));
            Arc::new(MetricsDestination::new(format!("{}-fanout", workflow.name), fan_out, self.metrics.clone()))
        };

        let subject = self.ids.subject(&workflow.name);
        let consumer = self.ids.consumer(&workflow.name);
        let subscription = self.broker.pull_subscribe(&subject, &consumer, &self.ids.stream).await?;

        let dequeuer = Dequeuer::new(
            source,
            fan_out,
            subscription,
            workflow.batch_size,
            workflow.concurrency,
            workflow.cleanup,
            workflow.webhook.clone(),
            workflow.on_error,
            self.metrics.clone(),
        );
        let cancel = self.cancel.clone();
        let name = workflow.name.clone();

        self.handles.push(tokio::spawn(async move {
            tracing::info!(workflow = %name, "dequeuer starting");
            dequeuer.run(cancel).await;
            tracing::info!(workflow = %name, "dequeuer stopped");
        }));
        Ok(())
    }

    /// `true` while the runner's root cancellation has not fired —
    /// backs the `/healthz` endpoint.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Cancel every workflow task and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}
