use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "trajqm")]
#[command(version, about = "Per-frame quantum chemistry over MD trajectories")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write logs to trajqm.log in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compute every trajectory frame missing from the store
    Run {
        /// Workflow input file (YAML)
        #[arg(short, long)]
        input: PathBuf,

        /// Maximum concurrent solver invocations (overrides the input file)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Store results even when the SCF did not converge
        #[arg(long)]
        ignore_warnings: bool,

        /// Print progress events as JSON lines
        #[arg(long)]
        events_json: bool,
    },
    /// Show which frames already have stored results
    Status {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Check an input file, its trajectory and restart points
    Validate {
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = trajqm::logging::init(cli.verbose, cli.log_json, cli.log_dir.as_deref())
        .context("Failed to initialize logging")?;

    match &cli.command {
        Commands::Run {
            input,
            max_parallel,
            ignore_warnings,
            events_json,
        } => {
            cmd::cmd_run(input, *max_parallel, *ignore_warnings, *events_json).await?;
        }
        Commands::Status { input } => cmd::cmd_status(input)?,
        Commands::Validate { input } => cmd::cmd_validate(input)?,
    }

    Ok(())
}
