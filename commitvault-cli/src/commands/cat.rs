use anyhow::{Context, Result};
use commitvault_core::{ContentHash, RepositoryId, Vault};
use std::io::Write;

/// Writes a file's bytes as of `rev` to stdout.
pub fn run(vault: &Vault, repo: String, rev: String, path: String) -> Result<()> {
    let repo = RepositoryId::new(repo);
    let head = super::resolve_revision(vault, &repo, &rev)?;
    let state = vault.graph().file_state(&head)?;

    let hash = state
        .get(&path)
        .with_context(|| format!("'{}' does not exist at {}", path, head.short()))?;
    write_blob(vault, hash)
}

fn write_blob(vault: &Vault, hash: &ContentHash) -> Result<()> {
    let content = vault.content().get(hash)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&content)?;
    stdout.flush()?;
    Ok(())
}
