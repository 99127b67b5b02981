use anyhow::{Context, Result};
use colored::Colorize;
use commitvault_core::{changes_between, ChangeKind, Error, FileState, RepositoryId, Vault};
use std::path::{Component, Path, PathBuf};

pub struct CommitArgs {
    pub repo: String,
    pub branch: String,
    pub message: String,
    pub files: Vec<PathBuf>,
    pub delete: Vec<String>,
    pub author: String,
    /// Directory the file paths are relative to.
    pub workdir: PathBuf,
}

/// Stores the given files, removes the `--delete` paths and commits the
/// resulting state on top of the branch head.
pub fn run(vault: &Vault, args: CommitArgs) -> Result<()> {
    let repo = RepositoryId::new(args.repo);

    let (mut state, branch_exists) = match vault.branch_state(&repo, &args.branch) {
        Ok(state) => (state, true),
        Err(Error::BranchNotFound { .. }) => (FileState::new(), false),
        Err(e) => return Err(e.into()),
    };
    let before = state.clone();

    for file in &args.files {
        let key = vault_path(file)?;
        let on_disk = args.workdir.join(file);
        let content = std::fs::read(&on_disk)
            .with_context(|| format!("Failed to read {}", on_disk.display()))?;
        let hash = vault.store_file(&content)?;
        state.insert(key, hash);
    }

    for path in &args.delete {
        if state.remove(path).is_none() {
            anyhow::bail!("'{}' is not tracked on branch '{}'", path, args.branch);
        }
    }

    let changes = changes_between(&before, &state);
    if changes.is_empty() && branch_exists {
        println!("{}", "No changes to commit".yellow());
        return Ok(());
    }

    println!("{}", "Creating commit...".bold());
    let id = vault.commit_snapshot(&repo, &args.branch, &args.author, &args.message, &state)?;

    println!("{}", "✓ Commit created successfully!".green().bold());
    println!("  {}: {}", "Commit ID".bold(), id);
    println!("  {}: {}", "Branch".bold(), args.branch);
    println!("  {}: {}", "Author".bold(), args.author);
    println!("  {}: {}", "Message".bold(), args.message);
    for change in &changes {
        let icon = match change.kind {
            ChangeKind::Added => "+".green(),
            ChangeKind::Modified => "~".yellow(),
            ChangeKind::Deleted => "-".red(),
        };
        println!("    {} {}", icon, change.path);
    }

    Ok(())
}

/// Turns a relative filesystem path into a `/`-separated vault path.
pub fn vault_path(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .with_context(|| format!("{} is not valid UTF-8", path.display()))?
                    .to_string(),
            ),
            Component::CurDir => {}
            _ => anyhow::bail!(
                "{} must be a relative path inside the working directory",
                path.display()
            ),
        }
    }

    if parts.is_empty() {
        anyhow::bail!("{} does not name a file", path.display());
    }
    Ok(parts.join("/"))
}
