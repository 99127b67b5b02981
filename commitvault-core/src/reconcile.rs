//! File-level reconciliation between snapshots.
//!
//! A [`FileState`] maps paths to content hashes. Changes between two states are
//! derived per path; renames surface as a delete plus an add.

use crate::error::{Error, Result};
use crate::models::{ChangeKind, ContentHash, FileChange};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Snapshot of a repository's files at one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileState {
    files: BTreeMap<String, ContentHash>,
}

impl FileState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, hash: ContentHash) -> Self {
        self.insert(path, hash);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, hash: ContentHash) -> Option<ContentHash> {
        self.files.insert(path.into(), hash)
    }

    pub fn remove(&mut self, path: &str) -> Option<ContentHash> {
        self.files.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&ContentHash> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContentHash)> {
        self.files.iter().map(|(p, h)| (p.as_str(), h))
    }

    /// Returns the state that results from applying `changes` to this one.
    ///
    /// Each change must agree with the current state: an added path must be
    /// absent, and a modified or deleted path must currently hold the change's
    /// previous hash.
    pub fn apply(&self, changes: &[FileChange]) -> Result<FileState> {
        validate_changes(changes)?;

        let mut next = self.clone();
        for change in changes {
            let current = next.files.get(&change.path);
            let mismatch = |reason: String| Error::InvalidFileChange {
                path: change.path.clone(),
                reason,
            };

            match change.kind {
                ChangeKind::Added => {
                    if current.is_some() {
                        return Err(mismatch("path already exists in parent".to_string()));
                    }
                }
                ChangeKind::Modified | ChangeKind::Deleted => {
                    if current != change.previous_hash.as_ref() {
                        return Err(mismatch(match current {
                            Some(hash) => format!("parent holds {}", hash.short()),
                            None => "path does not exist in parent".to_string(),
                        }));
                    }
                }
            }

            match &change.new_hash {
                Some(hash) => next.files.insert(change.path.clone(), hash.clone()),
                None => next.files.remove(&change.path),
            };
        }

        Ok(next)
    }
}

impl FromIterator<(String, ContentHash)> for FileState {
    fn from_iter<I: IntoIterator<Item = (String, ContentHash)>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

/// Derives the file changes that turn `parent` into `new`, ordered by path.
pub fn changes_between(parent: &FileState, new: &FileState) -> Vec<FileChange> {
    let mut changes = Vec::new();

    for (path, hash) in &new.files {
        match parent.files.get(path) {
            None => changes.push(FileChange::added(path.clone(), hash.clone())),
            Some(previous) if previous != hash => changes.push(FileChange::modified(
                path.clone(),
                previous.clone(),
                hash.clone(),
            )),
            Some(_) => {}
        }
    }

    for (path, previous) in &parent.files {
        if !new.files.contains_key(path) {
            changes.push(FileChange::deleted(path.clone(), previous.clone()));
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

/// Checks every change's hash invariant and that no path appears twice.
pub fn validate_changes(changes: &[FileChange]) -> Result<()> {
    let mut seen = HashSet::new();
    for change in changes {
        change.validate()?;
        if !seen.insert(change.path.as_str()) {
            return Err(Error::InvalidFileChange {
                path: change.path.clone(),
                reason: "path changed more than once in one commit".to_string(),
            });
        }
    }
    Ok(())
}

/// Path-level union of two states that diverged from `base`.
///
/// A path takes whichever side changed it. When both sides changed it to
/// different results the path is reported as a conflict; file contents are
/// never merged.
pub fn merge_states(base: &FileState, ours: &FileState, theirs: &FileState) -> Result<FileState> {
    let paths: BTreeSet<&String> = base
        .files
        .keys()
        .chain(ours.files.keys())
        .chain(theirs.files.keys())
        .collect();

    let mut merged = FileState::new();
    let mut conflicts = Vec::new();

    for path in paths {
        let b = base.files.get(path);
        let o = ours.files.get(path);
        let t = theirs.files.get(path);

        let resolved = if o == t || t == b {
            o
        } else if o == b {
            t
        } else {
            conflicts.push(path.clone());
            continue;
        };

        if let Some(hash) = resolved {
            merged.files.insert(path.clone(), hash.clone());
        }
    }

    if conflicts.is_empty() {
        Ok(merged)
    } else {
        Err(Error::MergeConflict { paths: conflicts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(content: &str) -> ContentHash {
        ContentHash::of(content.as_bytes())
    }

    #[test]
    fn test_changes_between() {
        let parent = FileState::new()
            .with_file("keep.txt", h("same"))
            .with_file("edit.txt", h("old"))
            .with_file("gone.txt", h("bye"));
        let new = FileState::new()
            .with_file("keep.txt", h("same"))
            .with_file("edit.txt", h("new"))
            .with_file("fresh.txt", h("hi"));

        let changes = changes_between(&parent, &new);

        assert_eq!(
            changes,
            vec![
                FileChange::modified("edit.txt", h("old"), h("new")),
                FileChange::added("fresh.txt", h("hi")),
                FileChange::deleted("gone.txt", h("bye")),
            ]
        );
    }

    #[test]
    fn test_identical_states_have_no_changes() {
        let state = FileState::new().with_file("a", h("a"));
        assert!(changes_between(&state, &state).is_empty());
        assert!(changes_between(&FileState::new(), &FileState::new()).is_empty());
    }

    #[test]
    fn test_rename_is_delete_plus_add() {
        let parent = FileState::new().with_file("old/name.rs", h("body"));
        let new = FileState::new().with_file("new/name.rs", h("body"));

        let changes = changes_between(&parent, &new);
        let kinds: Vec<_> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Added, ChangeKind::Deleted]);
    }

    #[test]
    fn test_apply_inverts_changes_between() {
        let parent = FileState::new()
            .with_file("a", h("1"))
            .with_file("b", h("2"));
        let new = FileState::new()
            .with_file("a", h("1*"))
            .with_file("c", h("3"));

        let changes = changes_between(&parent, &new);
        assert_eq!(parent.apply(&changes).unwrap(), new);
    }

    #[test]
    fn test_apply_rejects_inconsistent_changes() {
        let parent = FileState::new().with_file("a", h("1"));

        let re_add = [FileChange::added("a", h("2"))];
        assert!(matches!(
            parent.apply(&re_add),
            Err(Error::InvalidFileChange { .. })
        ));

        let stale = [FileChange::modified("a", h("0"), h("2"))];
        assert!(parent.apply(&stale).is_err());

        let missing = [FileChange::deleted("b", h("1"))];
        assert!(parent.apply(&missing).is_err());
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let changes = [
            FileChange::added("a", h("1")),
            FileChange::added("a", h("2")),
        ];
        assert!(matches!(
            validate_changes(&changes),
            Err(Error::InvalidFileChange { .. })
        ));
    }

    #[test]
    fn test_merge_states_union() {
        let base = FileState::new()
            .with_file("shared", h("base"))
            .with_file("dropped", h("x"));
        let ours = base.clone().with_file("ours.txt", h("o"));
        let mut theirs = base.clone().with_file("shared", h("theirs"));
        theirs.remove("dropped");

        let merged = merge_states(&base, &ours, &theirs).unwrap();

        assert_eq!(merged.get("shared"), Some(&h("theirs")));
        assert_eq!(merged.get("ours.txt"), Some(&h("o")));
        assert!(!merged.contains("dropped"));
    }

    #[test]
    fn test_merge_states_conflict() {
        let base = FileState::new().with_file("a", h("base"));
        let ours = FileState::new().with_file("a", h("ours"));
        let theirs = FileState::new().with_file("a", h("theirs"));

        match merge_states(&base, &ours, &theirs) {
            Err(Error::MergeConflict { paths }) => assert_eq!(paths, vec!["a".to_string()]),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_states_same_edit_on_both_sides() {
        let base = FileState::new();
        let ours = FileState::new().with_file("a", h("same"));
        let theirs = ours.clone();

        assert_eq!(merge_states(&base, &ours, &theirs).unwrap(), ours);
    }
}
