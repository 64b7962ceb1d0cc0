//! vpcd — the vpcgrid daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Router agent (simulated in standalone mode) and public IP pools
//! - Reconciler, lifecycle manager, and its supervisor
//! - REST API
//!
//! # Usage
//!
//! ```text
//! vpcd standalone --port 8080 --data-dir /var/lib/vpcgrid --config vpcd.toml
//! vpcd print-config
//! ```

mod standalone;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use vpcgrid_core::VpcGridConfig;

#[derive(Parser)]
#[command(name = "vpcd", about = "vpcgrid VPC router control plane")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run everything in one process against the simulated router agent.
    Standalone {
        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/vpcgrid")]
        data_dir: PathBuf,

        /// Configuration file (vpcd.toml). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML.
    PrintConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<VpcGridConfig> {
    match path {
        Some(path) => VpcGridConfig::from_file(path),
        None => Ok(VpcGridConfig::standalone()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,vpcd=debug,vpcgrid=debug"))?;
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Standalone {
            port,
            data_dir,
            config,
        } => {
            let config = load_config(config.as_ref())?;
            standalone::run_standalone(port, data_dir, config).await
        }
        Command::PrintConfig { config } => {
            let config = load_config(config.as_ref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
