use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;

use commands::branch::BranchCommand;
use commands::commit::CommitArgs;
use commands::mr::MrCommand;
use commands::repo::RepoCommand;
use commands::{branch, cat, commit, log, mr, repo, show};
use config::Config;

#[derive(Parser)]
#[command(name = "cvault")]
#[command(version, about = "Commit graph, branches and merge requests in one SQLite file", long_about = None)]
struct Cli {
    /// Database path
    #[arg(short, long, global = true)]
    db: Option<PathBuf>,

    /// Config file (defaults to .commitvault/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Acting user reference recorded as author, reviewer or merger
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage repositories
    #[command(subcommand)]
    Repo(RepoCommand),

    /// Manage branches
    #[command(subcommand)]
    Branch(BranchCommand),

    /// Commit files on a branch
    Commit {
        /// Repository identifier
        repo: String,

        /// Branch to commit on (created if missing)
        branch: String,

        /// Commit message
        #[arg(short, long)]
        message: String,

        /// Files to add or update, relative to the current directory
        files: Vec<PathBuf>,

        /// Tracked paths to remove
        #[arg(long)]
        delete: Vec<String>,
    },

    /// Show commit history
    Log {
        /// Repository identifier
        repo: String,

        /// Branch name or commit id
        #[arg(default_value = "main")]
        rev: String,

        /// Number of commits to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show a single commit
    Show {
        /// Repository identifier
        repo: String,

        /// Branch name or commit id
        rev: String,
    },

    /// Print a file as of a revision
    Cat {
        /// Repository identifier
        repo: String,

        /// Branch name or commit id
        rev: String,

        /// File path inside the repository
        path: String,
    },

    /// Work with merge requests
    #[command(subcommand)]
    Mr(MrCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let config = Config::load(cli.config.as_deref(), &cwd)?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level(cli.verbose)?)
        .with_writer(std::io::stderr)
        .init();

    let vault = commands::open_vault(&config.database_path(cli.db, &cwd))?;
    let author = config.author(cli.user);

    match cli.command {
        Commands::Repo(command) => {
            repo::run(&vault, command)?;
        }
        Commands::Branch(command) => {
            branch::run(&vault, command)?;
        }
        Commands::Commit {
            repo,
            branch,
            message,
            files,
            delete,
        } => {
            commit::run(
                &vault,
                CommitArgs {
                    repo,
                    branch,
                    message,
                    files,
                    delete,
                    author,
                    workdir: cwd,
                },
            )?;
        }
        Commands::Log { repo, rev, limit } => {
            log::run(&vault, repo, rev, limit)?;
        }
        Commands::Show { repo, rev } => {
            show::run(&vault, repo, rev)?;
        }
        Commands::Cat { repo, rev, path } => {
            cat::run(&vault, repo, rev, path)?;
        }
        Commands::Mr(command) => {
            mr::run(&vault, &author, command)?;
        }
    }

    Ok(())
}
