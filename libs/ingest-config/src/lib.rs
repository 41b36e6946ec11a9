pub mod error;
pub mod schema;

use std::collections::HashSet;

pub use error::ConfigError;
pub use schema::{PluginBinding, WorkflowConfig};

/// The full workflow configuration file (`spec.md` §6 schema).
#[derive(Debug, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sources: Vec<PluginBinding>,
    #[serde(default)]
    pub destinations: Vec<PluginBinding>,
    #[serde(default)]
    pub workflows: Vec<WorkflowConfig>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read { path: path.to_string(), source: e })?;
        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse { path: path.to_string(), source: e })?;
        config.validate()?;
        Ok(config)
    }

    /// Every referenced source/destination name resolves to a
    /// configured plugin binding (`spec.md` §3), plus each workflow's
    /// own structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let source_names: HashSet<&str> = self.sources.iter().map(|s| s.name.as_str()).collect();
        let destination_names: HashSet<&str> = self.destinations.iter().map(|d| d.name.as_str()).collect();

        for workflow in &self.workflows {
            if !source_names.contains(workflow.source.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "workflow '{}': source '{}' is not configured",
                    workflow.name, workflow.source
                )));
            }
            for destination in &workflow.destinations {
                if !destination_names.contains(destination.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "workflow '{}': destination '{}' is not configured",
                        workflow.name, destination
                    )));
                }
            }
            workflow.to_workflow().validate().map_err(ConfigError::Validation)?;
        }
        Ok(())
    }

    pub fn workflows(&self) -> Vec<ingest_api::Workflow> {
        self.workflows.iter().map(WorkflowConfig::to_workflow).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
sources:
  - name: s3-in
    type: s3
    bucket: my-bucket
    region: us-east-1
destinations:
  - name: s3-out
    type: s3
    bucket: other-bucket
workflows:
  - name: sync
    source: s3-in
    destinations: [s3-out]
    cleanUp: true
    interval: 1m
    batchSize: 4
    webhook: https://example.invalid/hook
"#;

    #[test]
    fn parses_workflow_schema_and_applies_defaults() {
        let config: Config = serde_yaml::from_str(YAML).unwrap();
        config.validate().unwrap();

        let workflows = config.workflows();
        assert_eq!(workflows.len(), 1);
        let wf = &workflows[0];
        assert_eq!(wf.name, "sync");
        assert_eq!(wf.batch_size, 4);
        assert_eq!(wf.concurrency, 4, "concurrency defaults to batch_size");
        assert_eq!(wf.interval, std::time::Duration::from_secs(60));
        assert!(wf.cleanup);
        assert_eq!(wf.webhook.as_deref(), Some("https://example.invalid/hook"));

        let binding = &config.sources[0];
        assert_eq!(binding.config().get("bucket"), Some(&"my-bucket".to_string()));
    }

    #[test]
    fn interval_accepts_bare_nanoseconds() {
        let yaml = YAML.replace("interval: 1m", "interval: 60000000000");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.workflows[0].interval, std::time::Duration::from_secs(60));
    }

    #[test]
    fn missing_interval_and_batch_size_use_process_defaults() {
        let yaml = r#"
sources: [{name: s, type: s3}]
destinations: [{name: d, type: s3}]
workflows:
  - name: w
    source: s
    destinations: [d]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let wf = &config.workflows()[0];
        assert_eq!(wf.interval, std::time::Duration::from_secs(5 * 60));
        assert_eq!(wf.batch_size, 8);
        assert_eq!(wf.concurrency, 8);
    }

    #[test]
    fn validate_rejects_unconfigured_source() {
        let yaml = r#"
destinations: [{name: d, type: s3}]
workflows:
  - name: w
    source: missing
    destinations: [d]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
