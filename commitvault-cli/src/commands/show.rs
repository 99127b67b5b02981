use anyhow::Result;
use colored::Colorize;
use commitvault_core::{ChangeKind, RepositoryId, Vault};

pub fn run(vault: &Vault, repo: String, rev: String) -> Result<()> {
    let repo = RepositoryId::new(repo);
    let id = super::resolve_revision(vault, &repo, &rev)?;
    let commit = vault.graph().get_commit(&id)?;

    println!(
        "{} {}",
        "commit".yellow().bold(),
        commit.id.to_string().yellow()
    );
    for parent in &commit.parent_ids {
        println!("{}: {}", "Parent".bold(), parent);
    }
    println!("{}: {}", "Author".bold(), commit.author);
    println!(
        "{}: {}",
        "Date".bold(),
        commit.timestamp.format("%Y-%m-%d %H:%M:%S%.f UTC")
    );
    if let Some(mr) = commit.merge_request {
        println!("{}: {}", "Merge request".bold(), mr);
    }
    println!();
    for line in commit.message.lines() {
        println!("    {}", line);
    }
    println!();

    if commit.changes.is_empty() {
        println!("{}", "No file changes".dimmed());
        return Ok(());
    }

    for change in &commit.changes {
        match change.kind {
            ChangeKind::Added => {
                let hash = change.new_hash.as_ref().map(|h| h.short()).unwrap_or("");
                println!("  {} {} {}", "+".green(), change.path, hash.dimmed());
            }
            ChangeKind::Modified => {
                let before = change.previous_hash.as_ref().map(|h| h.short()).unwrap_or("");
                let after = change.new_hash.as_ref().map(|h| h.short()).unwrap_or("");
                println!(
                    "  {} {} {}",
                    "~".yellow(),
                    change.path,
                    format!("{} -> {}", before, after).dimmed()
                );
            }
            ChangeKind::Deleted => {
                println!("  {} {}", "-".red(), change.path);
            }
        }
    }

    Ok(())
}
