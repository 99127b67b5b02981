//! Append-only, content-addressed blob store.
//!
//! Writes are idempotent: storing the same bytes twice yields the same hash
//! and a single row, so concurrent writers never conflict.

use crate::error::{Error, Result};
use crate::models::ContentHash;
use crate::storage::{format_timestamp, Storage};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

#[derive(Clone)]
pub struct ContentStore {
    storage: Storage,
}

impl ContentStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn put(&self, content: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(content);

        let inserted = self.storage.write(|tx| {
            Ok(tx.execute(
                "INSERT OR IGNORE INTO blobs (hash, content, size, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    hash.as_str(),
                    content,
                    content.len() as i64,
                    format_timestamp(&Utc::now()),
                ],
            )?)
        })?;

        if inserted > 0 {
            debug!("Stored blob {} ({} bytes)", hash.short(), content.len());
        }

        Ok(hash)
    }

    pub fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let content: Option<Vec<u8>> = self.storage.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT content FROM blobs WHERE hash = ?1",
                    params![hash.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        content.ok_or_else(|| Error::ContentNotFound(hash.clone()))
    }

    pub fn contains(&self, hash: &ContentHash) -> Result<bool> {
        self.storage.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM blobs WHERE hash = ?1",
                    params![hash.as_str()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
    }

    pub fn size(&self, hash: &ContentHash) -> Result<u64> {
        let size: Option<i64> = self.storage.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT size FROM blobs WHERE hash = ?1",
                    params![hash.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        size.map(|s| s as u64)
            .ok_or_else(|| Error::ContentNotFound(hash.clone()))
    }
}
