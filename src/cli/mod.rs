// CLI module - User-facing command-line interface

mod output;

use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::process::Supervisor;
use crate::signals::SignalRouter;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Warden - supervise a set of background processes
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every process in a config file and supervise them until a
    /// shutdown signal arrives
    Run {
        /// Path to a .toml or .json configuration file
        config: PathBuf,

        /// Cap on each process's SIGTERM grace period during shutdown, in seconds
        #[arg(short, long)]
        shutdown_timeout: Option<u64>,

        /// Shut down once every process has finished on its own
        #[arg(short, long)]
        exit_when_done: bool,
    },

    /// Validate a config file and print the processes it defines
    Check {
        /// Path to a .toml or .json configuration file
        config: PathBuf,

        /// Print the parsed configuration as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Execute the parsed command and return the process exit code
    pub async fn execute(self) -> Result<i32> {
        match self.command {
            Commands::Run {
                config,
                shutdown_timeout,
                exit_when_done,
            } => run(&config, shutdown_timeout, exit_when_done).await,
            Commands::Check { config, json } => check(&config, json),
        }
    }
}

async fn run(path: &Path, shutdown_timeout: Option<u64>, exit_when_done: bool) -> Result<i32> {
    let config = WardenConfig::from_file(path)?;
    let stop_timeout = shutdown_timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.supervisor.shutdown_timeout());

    let supervisor = Arc::new(Supervisor::new(config.supervisor.clone())?);

    let errors = supervisor.add_all(config.processes).await;
    output::print_process_errors("register", &errors);

    let errors = supervisor.start_all().await;
    output::print_process_errors("start", &errors);

    let running = supervisor
        .status()
        .await
        .iter()
        .filter(|record| record.state.is_live())
        .count();
    output::print_success_msg(&format!("Supervising {} process(es)", running));

    let router = SignalRouter::new(Arc::clone(&supervisor), stop_timeout);
    let report = if exit_when_done {
        let waiter = Arc::clone(&supervisor);
        router
            .run_until(async move {
                waiter.wait_for_completion(Duration::MAX).await;
            })
            .await?
    } else {
        output::print_info("Press Ctrl+C to stop");
        router.run().await?
    };

    output::print_status_table(&supervisor.status().await);
    output::print_process_errors("stop", &report.errors);
    if report.timed_out {
        output::print_error(&format!(
            "Shutdown did not finish within {:?}",
            report.deadline
        ));
    }

    Ok(report.exit_code())
}

fn check(path: &Path, json: bool) -> Result<i32> {
    let config = WardenConfig::from_file(path)?;

    if json {
        let rendered = serde_json::to_string_pretty(&config)
            .map_err(|e| WardenError::Internal(format!("Failed to render config: {}", e)))?;
        println!("{}", rendered);
    } else {
        output::print_success_msg(&format!(
            "{} is valid ({} process(es))",
            path.display(),
            config.processes.len()
        ));
        output::print_config(&config);
    }

    Ok(0)
}
