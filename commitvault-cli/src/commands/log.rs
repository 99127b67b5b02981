use anyhow::Result;
use colored::Colorize;
use commitvault_core::{RepositoryId, Vault};

pub fn run(vault: &Vault, repo: String, rev: String, limit: Option<usize>) -> Result<()> {
    let repo = RepositoryId::new(repo);
    let head = super::resolve_revision(vault, &repo, &rev)?;
    let total = vault.graph().ancestors_of(&head).count();
    let commits = vault.graph().log(&head, limit)?;

    println!("{}", "Commit History".bold().cyan());
    println!();

    for commit in &commits {
        println!(
            "{} {}",
            "commit".yellow().bold(),
            commit.id.to_string().yellow()
        );
        if commit.is_merge() {
            let parents: Vec<&str> = commit.parent_ids.iter().map(|p| p.short()).collect();
            println!("{}: {}", "Merge".bold(), parents.join(" "));
        }
        println!("{}: {}", "Author".bold(), commit.author);
        println!(
            "{}: {}",
            "Date".bold(),
            commit.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        println!();
        for line in commit.message.lines() {
            println!("    {}", line);
        }
        println!();
        println!(
            "    {} file(s) changed",
            commit.changes.len().to_string().cyan()
        );

        for change in commit.changes.iter().take(5) {
            println!("      • {}", change.path.dimmed());
        }
        if commit.changes.len() > 5 {
            println!(
                "      {} and {} more...",
                "...".dimmed(),
                (commit.changes.len() - 5).to_string().dimmed()
            );
        }

        println!();
    }

    if total > commits.len() {
        println!(
            "{}",
            format!("... and {} more commits", total - commits.len()).dimmed()
        );
        println!("Use {} to see more", "--limit N".cyan());
    }

    Ok(())
}
