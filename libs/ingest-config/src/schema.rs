use std::collections::BTreeMap;
use std::time::Duration;

use ingest_api::{OnError, Workflow};
use serde::{Deserialize, Deserializer};

/// A `sources`/`destinations` entry: `{name, type, <plugin-specific
/// keys>}` (`spec.md` §6). The plugin-specific keys are collected into
/// a flat string map — the shape `PluginManager::new_source`/
/// `new_destination` already expect.
#[derive(Debug, Deserialize)]
pub struct PluginBinding {
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(flatten)]
    config: BTreeMap<String, serde_yaml::Value>,
}

impl PluginBinding {
    pub fn config(&self) -> BTreeMap<String, String> {
        self.config.iter().map(|(k, v)| (k.clone(), scalar_to_string(v))).collect()
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim_end().to_string(),
    }
}

/// One `workflows[]` entry (`spec.md` §6). `interval` accepts either a
/// bare number of nanoseconds or a duration string ("5m", "0"); the
/// process-wide defaults (`interval = 5m`, `batchSize = 8`,
/// `concurrency = batchSize`) are applied here at load time and never
/// mutated afterward (`SPEC_FULL.md` §9, "Global / default values").
#[derive(Debug, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    pub source: String,
    pub destinations: Vec<String>,
    #[serde(rename = "cleanUp", default)]
    pub cleanup: bool,
    #[serde(default = "default_interval", deserialize_with = "deserialize_interval")]
    pub interval: Duration,
    pub concurrency: Option<usize>,
    #[serde(rename = "batchSize", default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub webhook: Option<String>,
    /// Ack-or-nak policy on a failed `process` — resolves the "ack on
    /// processing failure" open question (`SPEC_FULL.md` §9.1).
    #[serde(rename = "onError", default)]
    pub on_error: OnError,
}

impl WorkflowConfig {
    pub fn to_workflow(&self) -> Workflow {
        Workflow {
            name: self.name.clone(),
            source: self.source.clone(),
            destinations: self.destinations.clone(),
            batch_size: self.batch_size,
            concurrency: self.concurrency.unwrap_or(self.batch_size),
            interval: self.interval,
            cleanup: self.cleanup,
            webhook: self.webhook.clone(),
            on_error: self.on_error,
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_batch_size() -> usize {
    8
}

fn deserialize_interval<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .map(Duration::from_nanos)
            .ok_or_else(|| serde::de::Error::custom("interval must be a non-negative integer (nanoseconds)")),
        serde_yaml::Value::String(s) => humantime::parse_duration(&s).map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("invalid interval value: {other:?}"))),
    }
}
