mod cli;
mod error;
mod http;
mod run;

use clap::Parser;
use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.as_filter().into()),
        )
        .init();

    if let Err(e) = run::run(cli).await {
        tracing::error!(error = %e, "ingest-server exited with an error");
        std::process::exit(1);
    }
}
