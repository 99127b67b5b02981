use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use commitvault_core::{RepositoryId, Vault};

#[derive(Subcommand)]
pub enum BranchCommand {
    /// Create a branch pointing at an existing commit or branch head
    Create {
        /// Repository identifier
        repo: String,

        /// New branch name
        name: String,

        /// Branch name or commit id to start from
        #[arg(long, default_value = "main")]
        from: String,
    },

    /// List branches and their heads
    List {
        /// Repository identifier
        repo: String,
    },
}

pub fn run(vault: &Vault, command: BranchCommand) -> Result<()> {
    match command {
        BranchCommand::Create { repo, name, from } => {
            let repo = RepositoryId::new(repo);
            let head = super::resolve_revision(vault, &repo, &from)?;
            vault.branches().create_branch(&repo, &name, &head)?;

            println!("{} {}", "✓ Created branch".green().bold(), name);
            println!("  {}: {}", "Head".bold(), head.short().yellow());
        }
        BranchCommand::List { repo } => {
            let repo = RepositoryId::new(repo);
            let branches = vault.branches().list_branches(&repo)?;
            if branches.is_empty() {
                println!("{}", "No branches yet".yellow());
                println!(
                    "Run {} to create one",
                    "cvault commit <repo> main -m \"message\" <files>".cyan()
                );
                return Ok(());
            }

            println!("{} {}", "Branches of".bold().cyan(), repo.to_string().bold());
            for branch in branches {
                let head = vault.graph().get_commit(&branch.head)?;
                println!(
                    "  {} {} {}",
                    branch.name.bold(),
                    branch.head.short().yellow(),
                    head.summary().dimmed()
                );
            }
        }
    }

    Ok(())
}
