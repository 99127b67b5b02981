pub mod branch;
pub mod cat;
pub mod commit;
pub mod log;
pub mod mr;
pub mod repo;
pub mod show;

use anyhow::{Context, Result};
use commitvault_core::{CommitId, RepositoryId, Vault};
use std::path::Path;

/// Opens (or creates) the vault database, creating its directory if needed.
pub fn open_vault(db_path: &Path) -> Result<Vault> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    Vault::open(db_path)
        .with_context(|| format!("Failed to open vault at {}", db_path.display()))
}

/// Accepts either a branch name or a full commit id.
pub fn resolve_revision(vault: &Vault, repository: &RepositoryId, rev: &str) -> Result<CommitId> {
    match vault.branches().get_head(repository, rev) {
        Ok(head) => Ok(head),
        Err(e) if e.is_not_found() => {
            let commit = vault
                .graph()
                .get_commit(&CommitId::new(rev))
                .with_context(|| format!("'{}' is neither a branch nor a commit", rev))?;
            if commit.repository != *repository {
                anyhow::bail!("Commit {} belongs to repository {}", rev, commit.repository);
            }
            Ok(commit.id)
        }
        Err(e) => Err(e.into()),
    }
}
