use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use warden::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = Cli::parse().execute().await.context("warden failed")?;
    std::process::exit(code);
}
