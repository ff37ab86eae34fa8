//! spotgridd: the spotgrid daemon.
//!
//! Assembles the state store, market engine, provisioner, and scheduler
//! into one process. Standalone mode backs them with an in-memory cloud
//! and an in-process cluster manager so the whole job lifecycle runs on a
//! laptop.
//!
//! # Usage
//!
//! ```text
//! spotgridd standalone --data-dir /var/lib/spotgrid --demo-jobs 3
//! spotgridd check-config --config spotgrid.toml
//! ```

mod control_plane;
mod local_cluster;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spotgridd", about = "spotgrid cluster orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every subsystem in one process against a simulated cloud.
    Standalone {
        /// Data directory for persistent state. Overrides the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,

        /// How long each simulated task runs before finishing.
        #[arg(long, default_value = "30")]
        simulate_job_secs: u64,

        /// Demo jobs to submit at startup.
        #[arg(long, default_value = "1")]
        demo_jobs: u32,
    },

    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,spotgridd=debug,spotgrid=debug".parse().unwrap());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            data_dir,
            config,
            log_format,
            simulate_job_secs,
            demo_jobs,
        } => {
            init_tracing(log_format);
            control_plane::run_standalone(control_plane::StandaloneOptions {
                data_dir,
                config,
                simulate_job_secs,
                demo_jobs,
            })
            .await
        }
        Command::CheckConfig { config } => {
            init_tracing(LogFormat::Text);
            control_plane::check_config(&config)
        }
    }
}
