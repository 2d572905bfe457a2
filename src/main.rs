use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ctlbench::config::BenchConfig;
use ctlbench::dimensions::DimensionSet;
use ctlbench::run::Coordinator;

#[derive(Parser)]
#[command(
    name = "ctlbench",
    about = "Stress and stability tests for SDN controllers under synthetic southbound load",
    version,
    long_about = None
)]
struct Cli {
    /// Log level, used when RUST_LOG is unset (overrides the config file)
    #[arg(long, global = true, env = "CTLBENCH_LOG")]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full test: pre-flight, every combination, teardown
    Run {
        /// Test configuration file
        #[arg(long, short)]
        config: PathBuf,

        /// Override the output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Override the results file name
        #[arg(long)]
        results: Option<String>,
    },

    /// Check that every handler exists and is executable
    Check {
        #[arg(long, short)]
        config: PathBuf,
    },

    /// Print the dimension combinations without running anything
    Plan {
        #[arg(long, short)]
        config: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn config_path(&self) -> &PathBuf {
        match self {
            Commands::Run { config, .. }
            | Commands::Check { config }
            | Commands::Plan { config, .. } => config,
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BenchConfig::load(cli.command.config_path())?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, cli.json_logs || config.logging.json);

    match cli.command {
        Commands::Run {
            output_dir,
            results,
            ..
        } => {
            if let Some(dir) = output_dir {
                config.test.output_dir = dir;
            }
            if let Some(file) = results {
                config.test.results_file = file;
            }
            tracing::info!(test = %config.test.name, "Starting test execution");
            let report = ctlbench::execute(config).await?;
            println!("{}", report);
        }
        Commands::Check { .. } => {
            let coordinator =
                Coordinator::from_config(config).context("failed to set up test execution")?;
            coordinator.check_handlers().await?;
            println!("All handlers present.");
        }
        Commands::Plan { json, .. } => {
            let dimensions = DimensionSet::from_config(&config);
            if json {
                let combinations: Vec<_> = dimensions.iter().collect();
                println!("{}", serde_json::to_string_pretty(&combinations)?);
            } else {
                println!("{} combination(s):", dimensions.len());
                for combination in dimensions.iter() {
                    println!("{:>4}  {}", combination.index, combination);
                }
            }
        }
    }

    Ok(())
}
