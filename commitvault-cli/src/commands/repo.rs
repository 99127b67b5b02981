use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use commitvault_core::{RepositoryId, Vault};

#[derive(Subcommand)]
pub enum RepoCommand {
    /// Register a new repository
    Create {
        /// Repository identifier
        name: String,
    },

    /// Delete a repository with its branches and merge requests
    Delete {
        /// Repository identifier
        name: String,
    },

    /// List repositories
    List,
}

pub fn run(vault: &Vault, command: RepoCommand) -> Result<()> {
    match command {
        RepoCommand::Create { name } => {
            let repo = vault.repositories().create(&RepositoryId::new(name))?;
            println!("{} {}", "✓ Created repository".green().bold(), repo.id);
        }
        RepoCommand::Delete { name } => {
            vault.repositories().delete(&RepositoryId::new(name.as_str()))?;
            println!("{} {}", "✓ Deleted repository".green().bold(), name);
            println!(
                "  {}",
                "Branches and merge requests were removed; commits are kept".dimmed()
            );
        }
        RepoCommand::List => {
            let repos = vault.repositories().list()?;
            if repos.is_empty() {
                println!("{}", "No repositories yet".yellow());
                return Ok(());
            }

            println!("{}", "Repositories".bold().cyan());
            for repo in repos {
                let branches = vault.branches().list_branches(&repo.id)?.len();
                println!(
                    "  {} {}",
                    repo.id.to_string().bold(),
                    format!(
                        "({} branch(es), created {})",
                        branches,
                        repo.created_at.format("%Y-%m-%d %H:%M:%S")
                    )
                    .dimmed()
                );
            }
        }
    }

    Ok(())
}
