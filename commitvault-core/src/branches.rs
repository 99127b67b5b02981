//! Named, mutable branch pointers.
//!
//! A branch head only moves through [`BranchManager::advance_head`], a
//! compare-and-swap against the head the caller last observed. Losing writers
//! get [`Error::ConcurrentModification`] and must re-read before retrying.

use crate::error::{Error, Result};
use crate::graph::repository_of;
use crate::models::{Branch, BranchId, CommitId, RepositoryId};
use crate::repositories::ensure_live;
use crate::storage::{format_timestamp, invalid_column, timestamp_column, Storage};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct BranchManager {
    storage: Storage,
}

impl BranchManager {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn create_branch(
        &self,
        repository: &RepositoryId,
        name: &str,
        initial_head: &CommitId,
    ) -> Result<BranchId> {
        validate_branch_name(name)?;
        let id = BranchId::new();

        self.storage.write(|tx| {
            ensure_live(tx, repository)?;
            ensure_commit_in(tx, repository, initial_head)?;

            if find_branch(tx, repository, name)?.is_some() {
                return Err(Error::DuplicateBranchName {
                    repository: repository.to_string(),
                    name: name.to_string(),
                });
            }

            let now = format_timestamp(&Utc::now());
            tx.execute(
                "INSERT INTO branches (id, repository_id, name, head, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    id.to_string(),
                    repository.as_str(),
                    name,
                    initial_head.as_str(),
                    now,
                ],
            )?;
            Ok(())
        })?;

        info!(
            "Created branch {}/{} at {}",
            repository,
            name,
            initial_head.short()
        );
        Ok(id)
    }

    pub fn get_head(&self, repository: &RepositoryId, name: &str) -> Result<CommitId> {
        self.get_branch(repository, name).map(|branch| branch.head)
    }

    pub fn get_branch(&self, repository: &RepositoryId, name: &str) -> Result<Branch> {
        self.storage.read(|conn| {
            ensure_live(conn, repository)?;
            find_branch(conn, repository, name)?.ok_or_else(|| Error::BranchNotFound {
                repository: repository.to_string(),
                name: name.to_string(),
            })
        })
    }

    pub fn list_branches(&self, repository: &RepositoryId) -> Result<Vec<Branch>> {
        self.storage.read(|conn| {
            ensure_live(conn, repository)?;
            let mut stmt = conn.prepare(
                "SELECT id, repository_id, name, head, created_at, updated_at
                 FROM branches WHERE repository_id = ?1 ORDER BY name",
            )?;
            let branches = stmt
                .query_map(params![repository.as_str()], branch_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            debug!("Listed {} branch(es) of {}", branches.len(), repository);
            Ok(branches)
        })
    }

    /// Moves `name` from `expected_current` to `new_head`.
    ///
    /// Fails with `ConcurrentModification`, leaving the branch untouched, if
    /// its head is no longer `expected_current`.
    pub fn advance_head(
        &self,
        repository: &RepositoryId,
        name: &str,
        expected_current: &CommitId,
        new_head: &CommitId,
    ) -> Result<()> {
        self.storage
            .write(|tx| compare_and_swap(tx, repository, name, expected_current, new_head))
    }
}

/// The branch compare-and-swap, usable inside a larger transaction.
pub(crate) fn compare_and_swap(
    conn: &Connection,
    repository: &RepositoryId,
    name: &str,
    expected_current: &CommitId,
    new_head: &CommitId,
) -> Result<()> {
    ensure_live(conn, repository)?;
    ensure_commit_in(conn, repository, new_head)?;

    let updated = conn.execute(
        "UPDATE branches SET head = ?1, updated_at = ?2
         WHERE repository_id = ?3 AND name = ?4 AND head = ?5",
        params![
            new_head.as_str(),
            format_timestamp(&Utc::now()),
            repository.as_str(),
            name,
            expected_current.as_str(),
        ],
    )?;

    if updated == 1 {
        info!(
            "Advanced {}/{}: {} -> {}",
            repository,
            name,
            expected_current.short(),
            new_head.short()
        );
        return Ok(());
    }

    match find_branch(conn, repository, name)? {
        None => Err(Error::BranchNotFound {
            repository: repository.to_string(),
            name: name.to_string(),
        }),
        Some(branch) => {
            warn!(
                "Lost race on {}/{}: expected {}, found {}",
                repository,
                name,
                expected_current.short(),
                branch.head.short()
            );
            Err(Error::ConcurrentModification {
                repository: repository.to_string(),
                branch: name.to_string(),
            })
        }
    }
}

/// Rejects names that are empty, contain whitespace or `..`, or start or end
/// with `/`.
pub fn validate_branch_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.contains("..")
        || name.starts_with('/')
        || name.ends_with('/')
        || name.chars().any(|c| c.is_whitespace() || c.is_control());

    if invalid {
        Err(Error::InvalidBranchName(name.to_string()))
    } else {
        Ok(())
    }
}

fn ensure_commit_in(conn: &Connection, repository: &RepositoryId, id: &CommitId) -> Result<()> {
    match repository_of(conn, id)? {
        Some(owner) if &owner == repository => Ok(()),
        _ => Err(Error::CommitNotFound(id.clone())),
    }
}

pub(crate) fn find_branch(conn: &Connection, repository: &RepositoryId, name: &str) -> Result<Option<Branch>> {
    Ok(conn
        .query_row(
            "SELECT id, repository_id, name, head, created_at, updated_at
             FROM branches WHERE repository_id = ?1 AND name = ?2",
            params![repository.as_str(), name],
            branch_from_row,
        )
        .optional()?)
}

fn branch_from_row(row: &Row) -> rusqlite::Result<Branch> {
    let id: String = row.get(0)?;
    let repository: String = row.get(1)?;
    let head: String = row.get(3)?;

    Ok(Branch {
        id: BranchId::parse(&id)
            .map_err(|_| invalid_column(0, "branch id", &id))?,
        repository: RepositoryId::new(repository),
        name: row.get(2)?,
        head: CommitId::new(head),
        created_at: timestamp_column(row, 4)?,
        updated_at: timestamp_column(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CommitGraph;
    use crate::models::NewCommit;
    use crate::repositories::Repositories;

    struct Fixture {
        branches: BranchManager,
        graph: CommitGraph,
        storage: Storage,
        repo: RepositoryId,
        root: CommitId,
    }

    fn setup() -> Fixture {
        let storage = Storage::in_memory().unwrap();
        let repo = RepositoryId::new("repo");
        Repositories::new(storage.clone()).create(&repo).unwrap();
        let graph = CommitGraph::new(storage.clone());
        let root = graph
            .create_commit(&repo, NewCommit::new("tester", "root"))
            .unwrap();

        Fixture {
            branches: BranchManager::new(storage.clone()),
            graph,
            storage,
            repo,
            root,
        }
    }

    #[test]
    fn test_branch_lifecycle() {
        let f = setup();
        f.branches.create_branch(&f.repo, "main", &f.root).unwrap();
        assert_eq!(f.branches.get_head(&f.repo, "main").unwrap(), f.root);

        let next = f
            .graph
            .create_commit(&f.repo, NewCommit::new("tester", "next").with_parent(f.root.clone()))
            .unwrap();
        f.branches
            .advance_head(&f.repo, "main", &f.root, &next)
            .unwrap();
        assert_eq!(f.branches.get_head(&f.repo, "main").unwrap(), next);
    }

    #[test]
    fn test_duplicate_branch_name() {
        let f = setup();
        f.branches.create_branch(&f.repo, "main", &f.root).unwrap();

        let result = f.branches.create_branch(&f.repo, "main", &f.root);
        assert!(matches!(result, Err(Error::DuplicateBranchName { .. })));
    }

    #[test]
    fn test_stale_expected_head_is_rejected() {
        let f = setup();
        f.branches.create_branch(&f.repo, "main", &f.root).unwrap();

        let a = f
            .graph
            .create_commit(&f.repo, NewCommit::new("tester", "a").with_parent(f.root.clone()))
            .unwrap();
        let b = f
            .graph
            .create_commit(&f.repo, NewCommit::new("tester", "b").with_parent(f.root.clone()))
            .unwrap();

        f.branches.advance_head(&f.repo, "main", &f.root, &a).unwrap();

        let result = f.branches.advance_head(&f.repo, "main", &f.root, &b);
        assert!(matches!(result, Err(Error::ConcurrentModification { .. })));
        assert_eq!(f.branches.get_head(&f.repo, "main").unwrap(), a);
    }

    #[test]
    fn test_stale_non_ascii_expected_head_is_logged() {
        let f = setup();
        f.branches.create_branch(&f.repo, "main", &f.root).unwrap();
        let next = f
            .graph
            .create_commit(&f.repo, NewCommit::new("tester", "next").with_parent(f.root.clone()))
            .unwrap();

        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .finish();

        let result = tracing::subscriber::with_default(subscriber, || {
            f.branches
                .advance_head(&f.repo, "main", &CommitId::new("aéééééé"), &next)
        });

        assert!(matches!(result, Err(Error::ConcurrentModification { .. })));
        assert_eq!(f.branches.get_head(&f.repo, "main").unwrap(), f.root);
    }

    #[test]
    fn test_missing_branch() {
        let f = setup();
        assert!(matches!(
            f.branches.get_head(&f.repo, "nope"),
            Err(Error::BranchNotFound { .. })
        ));
        assert!(matches!(
            f.branches.advance_head(&f.repo, "nope", &f.root, &f.root),
            Err(Error::BranchNotFound { .. })
        ));
    }

    #[test]
    fn test_head_must_belong_to_repository() {
        let f = setup();
        let ghost = CommitId::new("ghost");
        assert!(matches!(
            f.branches.create_branch(&f.repo, "main", &ghost),
            Err(Error::CommitNotFound(_))
        ));
    }

    #[test]
    fn test_branch_names() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("feature/login-form").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("a..b").is_err());
        assert!(validate_branch_name("/lead").is_err());
        assert!(validate_branch_name("trail/").is_err());
        assert!(validate_branch_name("has space").is_err());
    }

    #[test]
    fn test_branches_removed_with_repository() {
        let f = setup();
        f.branches.create_branch(&f.repo, "main", &f.root).unwrap();
        f.branches.create_branch(&f.repo, "dev", &f.root).unwrap();

        let names: Vec<_> = f
            .branches
            .list_branches(&f.repo)
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["dev", "main"]);

        Repositories::new(f.storage.clone()).delete(&f.repo).unwrap();
        assert!(matches!(
            f.branches.get_head(&f.repo, "main"),
            Err(Error::RepositoryNotFound(_))
        ));
    }
}
