use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// `ingest-server` — the enqueue/dequeue half of one configured
/// workflow set (`spec.md` §6). Subcommand-free: every CLI flag is
/// recognized directly, matching `bins/gauss-server`'s flat-flag style.
#[derive(Parser, Debug)]
#[command(name = "ingest-server", about = "Content synchronization pipeline runner", version)]
pub struct Cli {
    /// Internal HTTP bind address (`/healthz`, `/metrics`).
    #[arg(long, default_value = ":9090", env = "INGEST_LISTEN")]
    pub listen: String,

    /// Broker connection URL. `memory://` selects the in-process test
    /// broker; anything else is passed to the NATS client.
    #[arg(long, env = "INGEST_QUEUE_ENDPOINT")]
    pub queue_endpoint: String,

    /// JetStream stream name every workflow's subject lives on.
    #[arg(long, env = "INGEST_STREAM")]
    pub stream: String,

    /// Subject prefix; a workflow's subject is `<subject>.<workflow>`.
    #[arg(long, env = "INGEST_SUBJECT")]
    pub subject: String,

    /// Durable consumer prefix; a workflow's consumer is `<consumer>__<workflow>`.
    #[arg(long, env = "INGEST_CONSUMER")]
    pub consumer: String,

    /// Replica count used when provisioning the stream.
    #[arg(long, default_value_t = 1)]
    pub stream_replicas: usize,

    /// Maximum retained messages when provisioning the stream; -1 is unlimited.
    #[arg(long, default_value_t = -1)]
    pub max_msgs: i64,

    /// Which half of the pipeline this process runs.
    #[arg(long, value_enum)]
    pub mode: Mode,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Plugin search directory; repeatable, first hit wins.
    #[arg(long = "plugins", action = clap::ArgAction::Append)]
    pub plugin_dirs: Vec<PathBuf>,

    /// Path to the workflow YAML configuration.
    #[arg(long, default_value = "config.yaml", env = "INGEST_CONFIG")]
    pub config: String,

    /// Load and validate configuration, then exit without starting anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "lowercase")]
pub enum Mode {
    Enqueue,
    Dequeue,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "lowercase")]
pub enum LogLevel {
    All,
    Debug,
    Info,
    Warn,
    Error,
    None,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::All => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::None => "off",
        }
    }
}
