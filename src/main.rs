use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "mender")]
#[command(version, about = "Iterative review-and-repair loop for structured documents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit diagnostics on stderr as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate and repair documents until they converge or need a human
    Review(ReviewArgs),
    /// Run the validators once and report issues without changing anything
    Check(CheckArgs),
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone)]
pub struct ReviewArgs {
    /// Files, directories or glob patterns
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Write repaired documents back to disk
    #[arg(short, long)]
    pub write: bool,

    /// Print the batch report as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Review profile: fast, balanced or thorough. Overrides mender.toml.
    #[arg(long)]
    pub profile: Option<String>,

    /// Completion mode: strict, standard or permissive. Overrides mender.toml.
    #[arg(long)]
    pub mode: Option<String>,

    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Documents processed concurrently
    #[arg(long)]
    pub workers: Option<usize>,

    /// External agent command for the fixer and summarizer roles
    #[arg(long)]
    pub agent_cmd: Option<String>,

    /// One document at a time, validators in sequence
    #[arg(long)]
    pub sequential: bool,
}

#[derive(Args, Clone)]
pub struct CheckArgs {
    /// Files, directories or glob patterns
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Print results as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
    /// Initialize a default mender.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    mender::logging::init(cli.verbose, cli.log_json);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let passed = match &cli.command {
        Commands::Review(args) => cmd::cmd_review(&project_dir, args, cli.verbose).await?,
        Commands::Check(args) => cmd::cmd_check(&project_dir, args).await?,
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, command.clone())?;
            true
        }
    };

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}
