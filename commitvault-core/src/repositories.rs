use crate::error::{Error, Result};
use crate::models::{Repository, RepositoryId};
use crate::storage::{format_timestamp, timestamp_column, Storage};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

/// Registry of repositories known to the vault.
///
/// Deleting a repository removes its branches, merge requests and reviews.
/// Its commits and blobs are append-only and stay in the store, but the
/// repository id can never be reused.
#[derive(Clone)]
pub struct Repositories {
    storage: Storage,
}

impl Repositories {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn create(&self, id: &RepositoryId) -> Result<Repository> {
        let repository = Repository {
            id: id.clone(),
            created_at: Utc::now(),
        };

        self.storage.write(|tx| {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM repositories WHERE id = ?1",
                    params![id.as_str()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();

            if exists {
                return Err(Error::DuplicateRepository(id.to_string()));
            }

            tx.execute(
                "INSERT INTO repositories (id, created_at) VALUES (?1, ?2)",
                params![id.as_str(), format_timestamp(&repository.created_at)],
            )?;
            Ok(())
        })?;

        info!("Created repository {}", id);
        Ok(repository)
    }

    pub fn get(&self, id: &RepositoryId) -> Result<Repository> {
        self.storage.read(|conn| {
            conn.query_row(
                "SELECT id, created_at FROM repositories WHERE id = ?1 AND deleted_at IS NULL",
                params![id.as_str()],
                repository_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::RepositoryNotFound(id.to_string()))
        })
    }

    pub fn list(&self) -> Result<Vec<Repository>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at FROM repositories WHERE deleted_at IS NULL ORDER BY id",
            )?;
            let repositories = stmt
                .query_map([], repository_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(repositories)
        })
    }

    pub fn delete(&self, id: &RepositoryId) -> Result<()> {
        self.storage.write(|tx| {
            ensure_live(tx, id)?;

            tx.execute(
                "DELETE FROM reviews WHERE merge_request_id IN
                    (SELECT id FROM merge_requests WHERE repository_id = ?1)",
                params![id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM merge_requests WHERE repository_id = ?1",
                params![id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM branches WHERE repository_id = ?1",
                params![id.as_str()],
            )?;
            tx.execute(
                "UPDATE repositories SET deleted_at = ?1 WHERE id = ?2",
                params![format_timestamp(&Utc::now()), id.as_str()],
            )?;
            Ok(())
        })?;

        info!("Deleted repository {}", id);
        Ok(())
    }
}

/// Fails with `RepositoryNotFound` unless `id` names a live repository.
pub(crate) fn ensure_live(conn: &Connection, id: &RepositoryId) -> Result<()> {
    let live = conn
        .query_row(
            "SELECT 1 FROM repositories WHERE id = ?1 AND deleted_at IS NULL",
            params![id.as_str()],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    if live {
        Ok(())
    } else {
        Err(Error::RepositoryNotFound(id.to_string()))
    }
}

fn repository_from_row(row: &Row) -> rusqlite::Result<Repository> {
    let id: String = row.get(0)?;
    Ok(Repository {
        id: RepositoryId::new(id),
        created_at: timestamp_column(row, 1)?,
    })
}
