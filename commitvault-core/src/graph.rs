//! Append-only commit graph.
//!
//! Commits are immutable and may only reference parents that already exist,
//! so the graph is acyclic by construction. Each commit receives an arena
//! sequence number on insert; a parent's sequence is always smaller than its
//! child's, which traversal asserts.

use crate::error::{Error, Result};
use crate::models::{
    ChangeKind, Commit, CommitId, ContentHash, FileChange, MergeRequestId, NewCommit,
    RepositoryId,
};
use crate::reconcile::{validate_changes, FileState};
use crate::repositories::ensure_live;
use crate::storage::{format_timestamp, invalid_column, timestamp_column, Storage};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

const MAX_PARENTS: usize = 2;

#[derive(Clone)]
pub struct CommitGraph {
    storage: Storage,
}

/// Canonical input hashed into a [`CommitId`].
#[derive(Serialize)]
struct Fingerprint<'a> {
    repository: &'a RepositoryId,
    parents: &'a [CommitId],
    author: &'a str,
    message: &'a str,
    timestamp: String,
    changes: &'a [FileChange],
}

impl CommitGraph {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Appends a commit to `repository` and returns its id.
    ///
    /// Every parent must already exist in the same repository, at most two
    /// parents are allowed, and the file changes must be well formed and
    /// consistent with the first parent's file state (the empty state for a
    /// root commit). The id fingerprints the repository, parents, author,
    /// message, timestamp and changes; an identical fingerprint is reported
    /// as [`Error::DuplicateCommit`] rather than merged.
    pub fn create_commit(&self, repository: &RepositoryId, commit: NewCommit) -> Result<CommitId> {
        if commit.parent_ids.len() > MAX_PARENTS {
            return Err(Error::InvalidParentCount(commit.parent_ids.len()));
        }
        if commit.parent_ids.len() == 2 && commit.parent_ids[0] == commit.parent_ids[1] {
            return Err(Error::DuplicateParent(commit.parent_ids[0].clone()));
        }
        validate_changes(&commit.changes)?;

        for parent in &commit.parent_ids {
            let owner = self.storage.read(|conn| repository_of(conn, parent))?;
            if owner.as_ref() != Some(repository) {
                return Err(Error::UnknownParent(parent.clone()));
            }
        }

        let base = match commit.parent_ids.first() {
            Some(parent) => self.file_state(parent)?,
            None => FileState::new(),
        };
        base.apply(&commit.changes)?;

        let timestamp = commit.timestamp.unwrap_or_else(Utc::now);
        let id = fingerprint(repository, &commit, &timestamp)?;

        let sequence = self.storage.write(|tx| {
            ensure_live(tx, repository)?;

            if repository_of(tx, &id)?.is_some() {
                return Err(Error::DuplicateCommit(id.clone()));
            }

            tx.execute(
                "INSERT INTO commits (id, repository_id, author, message, timestamp, merge_request_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    repository.as_str(),
                    commit.author,
                    commit.message,
                    format_timestamp(&timestamp),
                    commit.merge_request.map(|mr| mr.to_string()),
                ],
            )?;
            let sequence = tx.last_insert_rowid();

            for (position, parent) in commit.parent_ids.iter().enumerate() {
                tx.execute(
                    "INSERT INTO commit_parents (commit_id, position, parent_id) VALUES (?1, ?2, ?3)",
                    params![id.as_str(), position as i64, parent.as_str()],
                )?;
            }

            for (position, change) in commit.changes.iter().enumerate() {
                tx.execute(
                    "INSERT INTO file_changes (commit_id, position, path, kind, new_hash, previous_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id.as_str(),
                        position as i64,
                        change.path,
                        change.kind.as_str(),
                        change.new_hash.as_ref().map(|h| h.as_str()),
                        change.previous_hash.as_ref().map(|h| h.as_str()),
                    ],
                )?;
            }

            Ok(sequence)
        })?;

        info!(
            "Appended commit {} (#{}) to {} with {} parent(s), {} change(s)",
            id.short(),
            sequence,
            repository,
            commit.parent_ids.len(),
            commit.changes.len()
        );

        Ok(id)
    }

    pub fn get_commit(&self, id: &CommitId) -> Result<Commit> {
        self.storage.read(|conn| load_commit(conn, id))
    }

    /// Breadth-first walk over `id` and everything reachable through parent
    /// edges. `id` itself is yielded first and no id is yielded twice.
    pub fn ancestors_of(&self, id: &CommitId) -> Ancestors<'_> {
        let mut visited = HashSet::new();
        visited.insert(id.clone());

        Ancestors {
            graph: self,
            queue: VecDeque::from([(id.clone(), None)]),
            visited,
            failed: false,
        }
    }

    /// Whether `ancestor` is reachable from `descendant` (or equal to it).
    pub fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool> {
        let (ancestor_seq, _) = self.storage.read(|conn| parents_of(conn, ancestor))?;
        let (descendant_seq, _) = self.storage.read(|conn| parents_of(conn, descendant))?;

        if ancestor_seq > descendant_seq {
            return Ok(false);
        }

        for candidate in self.ancestors_of(descendant) {
            if &candidate? == ancestor {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// The first commit reached breadth-first from `b` that is also an
    /// ancestor of `a`, or `None` for unrelated histories.
    pub fn merge_base(&self, a: &CommitId, b: &CommitId) -> Result<Option<CommitId>> {
        let reachable_from_a = self
            .ancestors_of(a)
            .collect::<Result<HashSet<CommitId>>>()?;

        for candidate in self.ancestors_of(b) {
            let candidate = candidate?;
            if reachable_from_a.contains(&candidate) {
                return Ok(Some(candidate));
            }
        }

        Ok(None)
    }

    /// Materializes the files present at `id` by replaying changes along the
    /// first-parent chain from the root.
    pub fn file_state(&self, id: &CommitId) -> Result<FileState> {
        self.storage.read(|conn| {
            if repository_of(conn, id)?.is_none() {
                return Err(Error::CommitNotFound(id.clone()));
            }

            let mut stmt = conn.prepare(
                "WITH RECURSIVE chain(id, depth) AS (
                     SELECT ?1, 0
                     UNION ALL
                     SELECT p.parent_id, chain.depth + 1
                     FROM commit_parents p JOIN chain ON p.commit_id = chain.id
                     WHERE p.position = 0
                 )
                 SELECT fc.path, fc.new_hash
                 FROM chain JOIN file_changes fc ON fc.commit_id = chain.id
                 ORDER BY chain.depth DESC, fc.position ASC",
            )?;

            let rows = stmt.query_map(params![id.as_str()], |row| {
                let path: String = row.get(0)?;
                let new_hash = optional_hash_column(row, 1)?;
                Ok((path, new_hash))
            })?;

            let mut state = FileState::new();
            for row in rows {
                let (path, new_hash) = row?;
                match new_hash {
                    Some(hash) => state.insert(path, hash),
                    None => state.remove(&path),
                };
            }

            debug!("Materialized {} file(s) at {}", state.len(), id.short());
            Ok(state)
        })
    }

    /// Number of commits ever appended to `repository`, reachable or not.
    pub fn commit_count(&self, repository: &RepositoryId) -> Result<u64> {
        self.storage.read(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM commits WHERE repository_id = ?1",
                params![repository.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Commits reachable from `head`, in breadth-first order.
    pub fn log(&self, head: &CommitId, limit: Option<usize>) -> Result<Vec<Commit>> {
        self.ancestors_of(head)
            .take(limit.unwrap_or(usize::MAX))
            .map(|id| self.get_commit(&id?))
            .collect()
    }
}

/// Lazy ancestor traversal returned by [`CommitGraph::ancestors_of`].
///
/// Restart by calling `ancestors_of` again. Panics if it observes a parent
/// that is not older than its child, which would mean the graph has a cycle.
pub struct Ancestors<'a> {
    graph: &'a CommitGraph,
    /// Pending ids with the sequence number of the child that reached them.
    queue: VecDeque<(CommitId, Option<i64>)>,
    visited: HashSet<CommitId>,
    failed: bool,
}

impl Iterator for Ancestors<'_> {
    type Item = Result<CommitId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let (id, child_seq) = self.queue.pop_front()?;
        let (sequence, parents) = match self.graph.storage.read(|conn| parents_of(conn, &id)) {
            Ok(found) => found,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        if let Some(child_seq) = child_seq {
            assert!(
                sequence < child_seq,
                "commit graph invariant violated: parent {} (#{}) is not older than its child (#{})",
                id,
                sequence,
                child_seq
            );
        }

        for parent in parents {
            if self.visited.insert(parent.clone()) {
                self.queue.push_back((parent, Some(sequence)));
            }
        }

        Some(Ok(id))
    }
}

fn fingerprint(
    repository: &RepositoryId,
    commit: &NewCommit,
    timestamp: &DateTime<Utc>,
) -> Result<CommitId> {
    let canonical = serde_json::to_vec(&Fingerprint {
        repository,
        parents: &commit.parent_ids,
        author: &commit.author,
        message: &commit.message,
        timestamp: format_timestamp(timestamp),
        changes: &commit.changes,
    })?;

    Ok(CommitId::new(ContentHash::of(&canonical).as_str()))
}

/// The repository a commit belongs to, if the commit exists.
pub(crate) fn repository_of(conn: &Connection, id: &CommitId) -> Result<Option<RepositoryId>> {
    let repository: Option<String> = conn
        .query_row(
            "SELECT repository_id FROM commits WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(repository.map(RepositoryId::new))
}

fn parents_of(conn: &Connection, id: &CommitId) -> Result<(i64, Vec<CommitId>)> {
    let sequence: i64 = conn
        .query_row(
            "SELECT seq FROM commits WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::CommitNotFound(id.clone()))?;

    let mut stmt = conn.prepare(
        "SELECT parent_id FROM commit_parents WHERE commit_id = ?1 ORDER BY position",
    )?;
    let parents = stmt
        .query_map(params![id.as_str()], |row| {
            row.get::<_, String>(0).map(CommitId::new)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok((sequence, parents))
}

fn load_commit(conn: &Connection, id: &CommitId) -> Result<Commit> {
    let mut commit = conn
        .query_row(
            "SELECT seq, id, repository_id, author, message, timestamp, merge_request_id
             FROM commits WHERE id = ?1",
            params![id.as_str()],
            commit_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::CommitNotFound(id.clone()))?;

    let (_, parents) = parents_of(conn, id)?;
    commit.parent_ids = parents;

    let mut stmt = conn.prepare(
        "SELECT path, kind, new_hash, previous_hash
         FROM file_changes WHERE commit_id = ?1 ORDER BY position",
    )?;
    commit.changes = stmt
        .query_map(params![id.as_str()], file_change_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(commit)
}

fn commit_from_row(row: &Row) -> rusqlite::Result<Commit> {
    let sequence: i64 = row.get(0)?;
    let id: String = row.get(1)?;
    let repository: String = row.get(2)?;
    let merge_request: Option<String> = row.get(6)?;

    let merge_request = merge_request
        .map(|raw| {
            MergeRequestId::parse(&raw).map_err(|_| invalid_column(6, "merge request id", &raw))
        })
        .transpose()?;

    Ok(Commit {
        id: CommitId::new(id),
        repository: RepositoryId::new(repository),
        sequence: sequence as u64,
        author: row.get(3)?,
        message: row.get(4)?,
        timestamp: timestamp_column(row, 5)?,
        parent_ids: Vec::new(),
        changes: Vec::new(),
        merge_request,
    })
}

fn file_change_from_row(row: &Row) -> rusqlite::Result<FileChange> {
    let kind: String = row.get(1)?;
    Ok(FileChange {
        path: row.get(0)?,
        kind: ChangeKind::parse(&kind).ok_or_else(|| invalid_column(1, "change kind", &kind))?,
        new_hash: optional_hash_column(row, 2)?,
        previous_hash: optional_hash_column(row, 3)?,
    })
}

fn optional_hash_column(row: &Row, idx: usize) -> rusqlite::Result<Option<ContentHash>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| ContentHash::parse(&s).map_err(|_| invalid_column(idx, "content hash", &s)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::Repositories;
    use chrono::TimeZone;

    fn setup() -> (CommitGraph, RepositoryId) {
        let storage = Storage::in_memory().unwrap();
        let repo = RepositoryId::new("repo");
        Repositories::new(storage.clone()).create(&repo).unwrap();
        (CommitGraph::new(storage), repo)
    }

    fn h(content: &str) -> ContentHash {
        ContentHash::of(content.as_bytes())
    }

    fn commit(graph: &CommitGraph, repo: &RepositoryId, msg: &str, parents: &[&CommitId]) -> CommitId {
        let parents = parents.iter().map(|p| (*p).clone()).collect();
        graph
            .create_commit(repo, NewCommit::new("tester", msg).with_parents(parents))
            .unwrap()
    }

    #[test]
    fn test_root_commit() {
        let (graph, repo) = setup();
        let id = graph
            .create_commit(
                &repo,
                NewCommit::new("alice", "Initial commit")
                    .with_change(FileChange::added("README.md", h("hello"))),
            )
            .unwrap();

        let stored = graph.get_commit(&id).unwrap();
        assert!(stored.is_root());
        assert_eq!(stored.author, "alice");
        assert_eq!(stored.repository, repo);
        assert_eq!(stored.changes, vec![FileChange::added("README.md", h("hello"))]);
    }

    #[test]
    fn test_unknown_parent() {
        let (graph, repo) = setup();
        let ghost = CommitId::new("does-not-exist");

        let result = graph.create_commit(&repo, NewCommit::new("a", "m").with_parent(ghost));
        assert!(matches!(result, Err(Error::UnknownParent(_))));
    }

    #[test]
    fn test_parent_from_other_repository() {
        let (graph, repo) = setup();
        let other = RepositoryId::new("other");
        Repositories::new(graph.storage.clone()).create(&other).unwrap();

        let foreign = commit(&graph, &other, "root", &[]);
        let result = graph.create_commit(&repo, NewCommit::new("a", "m").with_parent(foreign));
        assert!(matches!(result, Err(Error::UnknownParent(_))));
    }

    #[test]
    fn test_parent_count_limits() {
        let (graph, repo) = setup();
        let a = commit(&graph, &repo, "a", &[]);
        let b = commit(&graph, &repo, "b", &[]);
        let c = commit(&graph, &repo, "c", &[]);

        let octopus = NewCommit::new("x", "octopus").with_parents(vec![a.clone(), b, c]);
        assert!(matches!(
            graph.create_commit(&repo, octopus),
            Err(Error::InvalidParentCount(3))
        ));

        let twice = NewCommit::new("x", "twice").with_parents(vec![a.clone(), a]);
        assert!(matches!(
            graph.create_commit(&repo, twice),
            Err(Error::DuplicateParent(_))
        ));
    }

    #[test]
    fn test_invalid_file_change_rejected() {
        let (graph, repo) = setup();
        let same = FileChange::modified("a", h("x"), h("x"));

        let result = graph.create_commit(&repo, NewCommit::new("a", "m").with_change(same));
        assert!(matches!(result, Err(Error::InvalidFileChange { .. })));
    }

    #[test]
    fn test_changes_must_match_parent_state() {
        let (graph, repo) = setup();
        let root = graph
            .create_commit(
                &repo,
                NewCommit::new("a", "root").with_change(FileChange::added("a", h("1"))),
            )
            .unwrap();

        let stale = NewCommit::new("a", "edit")
            .with_parent(root.clone())
            .with_change(FileChange::modified("a", h("0"), h("2")));
        assert!(matches!(
            graph.create_commit(&repo, stale),
            Err(Error::InvalidFileChange { .. })
        ));

        let ok = NewCommit::new("a", "edit")
            .with_parent(root)
            .with_change(FileChange::modified("a", h("1"), h("2")));
        assert!(graph.create_commit(&repo, ok).is_ok());
    }

    #[test]
    fn test_identical_fingerprint_is_detected() {
        let (graph, repo) = setup();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        let first = graph
            .create_commit(&repo, NewCommit::new("a", "same").at(at))
            .unwrap();
        let second = graph.create_commit(&repo, NewCommit::new("a", "same").at(at));

        match second {
            Err(Error::DuplicateCommit(id)) => assert_eq!(id, first),
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_deleted_repository_rejects_commits() {
        let (graph, repo) = setup();
        Repositories::new(graph.storage.clone()).delete(&repo).unwrap();

        let result = graph.create_commit(&repo, NewCommit::new("a", "m"));
        assert!(matches!(result, Err(Error::RepositoryNotFound(_))));
    }

    #[test]
    fn test_parents_are_older_than_children() {
        let (graph, repo) = setup();
        let root = commit(&graph, &repo, "root", &[]);
        let left = commit(&graph, &repo, "left", &[&root]);
        let right = commit(&graph, &repo, "right", &[&root]);
        let merge = commit(&graph, &repo, "merge", &[&left, &right]);

        for id in graph.ancestors_of(&merge) {
            let child = graph.get_commit(&id.unwrap()).unwrap();
            for parent in &child.parent_ids {
                assert!(graph.get_commit(parent).unwrap().sequence < child.sequence);
            }
        }
    }

    #[test]
    fn test_ancestors_dedup_diamond() {
        let (graph, repo) = setup();
        let root = commit(&graph, &repo, "root", &[]);
        let left = commit(&graph, &repo, "left", &[&root]);
        let right = commit(&graph, &repo, "right", &[&root]);
        let merge = commit(&graph, &repo, "merge", &[&left, &right]);

        let walked: Vec<CommitId> = graph
            .ancestors_of(&merge)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(walked, vec![merge.clone(), left, right, root]);

        let again: Vec<CommitId> = graph.ancestors_of(&merge).collect::<Result<_>>().unwrap();
        assert_eq!(walked, again);
    }

    #[test]
    fn test_ancestors_of_missing_commit() {
        let (graph, _) = setup();
        let mut walk = graph.ancestors_of(&CommitId::new("nope"));

        assert!(matches!(walk.next(), Some(Err(Error::CommitNotFound(_)))));
        assert!(walk.next().is_none());
    }

    #[test]
    fn test_is_ancestor_and_merge_base() {
        let (graph, repo) = setup();
        let root = commit(&graph, &repo, "root", &[]);
        let main = commit(&graph, &repo, "main", &[&root]);
        let feature = commit(&graph, &repo, "feature", &[&root]);

        assert!(graph.is_ancestor(&root, &feature).unwrap());
        assert!(graph.is_ancestor(&feature, &feature).unwrap());
        assert!(!graph.is_ancestor(&feature, &root).unwrap());
        assert!(!graph.is_ancestor(&main, &feature).unwrap());

        assert_eq!(graph.merge_base(&main, &feature).unwrap(), Some(root));

        let unrelated = commit(&graph, &repo, "orphan", &[]);
        assert_eq!(graph.merge_base(&main, &unrelated).unwrap(), None);
    }

    #[test]
    fn test_file_state_follows_first_parent() {
        let (graph, repo) = setup();
        let root = graph
            .create_commit(
                &repo,
                NewCommit::new("a", "root")
                    .with_change(FileChange::added("a.txt", h("1")))
                    .with_change(FileChange::added("b.txt", h("1"))),
            )
            .unwrap();
        let next = graph
            .create_commit(
                &repo,
                NewCommit::new("a", "edit")
                    .with_parent(root.clone())
                    .with_change(FileChange::modified("a.txt", h("1"), h("2")))
                    .with_change(FileChange::deleted("b.txt", h("1"))),
            )
            .unwrap();

        let state = graph.file_state(&next).unwrap();
        assert_eq!(state, FileState::new().with_file("a.txt", h("2")));
        assert_eq!(graph.file_state(&root).unwrap().len(), 2);
    }

    #[test]
    fn test_log_limit() {
        let (graph, repo) = setup();
        let root = commit(&graph, &repo, "one", &[]);
        let two = commit(&graph, &repo, "two", &[&root]);
        let three = commit(&graph, &repo, "three", &[&two]);

        let log = graph.log(&three, Some(2)).unwrap();
        let messages: Vec<_> = log.iter().map(|c| c.message.as_str()).collect();
        assert_eq!(messages, vec!["three", "two"]);
        assert_eq!(graph.log(&three, None).unwrap().len(), 3);
    }
}
