use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque string identifiers. Callers must not assume any structure.
macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Identifiers minted by the core as random UUIDs.
macro_rules! generated_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| Error::InvalidId(s.to_string()))
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

opaque_id!(
    /// A repository owned by the surrounding project-management layer.
    RepositoryId
);

opaque_id!(
    /// Fingerprint of a commit's content; see [`crate::graph::CommitGraph::create_commit`].
    CommitId
);

impl CommitId {
    /// At most the first ten characters; ids are opaque and may be non-ASCII.
    pub fn short(&self) -> &str {
        char_prefix(&self.0, 10)
    }
}

fn char_prefix(s: &str, chars: usize) -> &str {
    s.char_indices().nth(chars).map_or(s, |(end, _)| &s[..end])
}

generated_id!(BranchId);
generated_id!(MergeRequestId);
generated_id!(ReviewId);

/// SHA-256 of a blob, lowercase hex. Deserializing validates the format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::InvalidId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        char_prefix(&self.0, 10)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(ChangeKind::Added),
            "modified" => Some(ChangeKind::Modified),
            "deleted" => Some(ChangeKind::Deleted),
            _ => None,
        }
    }
}

/// One file-level change recorded on a commit.
///
/// Hash presence follows the kind: `Added` has only `new_hash`, `Deleted`
/// has only `previous_hash`, and `Modified` has both with different values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub new_hash: Option<ContentHash>,
    pub previous_hash: Option<ContentHash>,
}

impl FileChange {
    pub fn added(path: impl Into<String>, new_hash: ContentHash) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Added,
            new_hash: Some(new_hash),
            previous_hash: None,
        }
    }

    pub fn modified(
        path: impl Into<String>,
        previous_hash: ContentHash,
        new_hash: ContentHash,
    ) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Modified,
            new_hash: Some(new_hash),
            previous_hash: Some(previous_hash),
        }
    }

    pub fn deleted(path: impl Into<String>, previous_hash: ContentHash) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Deleted,
            new_hash: None,
            previous_hash: Some(previous_hash),
        }
    }

    /// Checks the hash-presence invariant for this change's kind.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidFileChange {
            path: self.path.clone(),
            reason: reason.to_string(),
        };

        if self.path.is_empty() {
            return Err(invalid("path is empty"));
        }

        match (self.kind, &self.previous_hash, &self.new_hash) {
            (ChangeKind::Added, None, Some(_)) => Ok(()),
            (ChangeKind::Added, _, _) => {
                Err(invalid("added file needs a new hash and no previous hash"))
            }
            (ChangeKind::Deleted, Some(_), None) => Ok(()),
            (ChangeKind::Deleted, _, _) => {
                Err(invalid("deleted file needs a previous hash and no new hash"))
            }
            (ChangeKind::Modified, Some(before), Some(after)) if before != after => Ok(()),
            (ChangeKind::Modified, Some(_), Some(_)) => {
                Err(invalid("modified file must change its hash"))
            }
            (ChangeKind::Modified, _, _) => {
                Err(invalid("modified file needs both previous and new hashes"))
            }
        }
    }
}

/// An immutable node of the commit graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub repository: RepositoryId,
    /// Position in the append-only arena; every parent has a smaller value.
    pub sequence: u64,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub parent_ids: Vec<CommitId>,
    pub changes: Vec<FileChange>,
    pub merge_request: Option<MergeRequestId>,
}

impl Commit {
    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() > 1
    }

    pub fn first_parent(&self) -> Option<&CommitId> {
        self.parent_ids.first()
    }

    /// First line of the message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }
}

/// Input to [`crate::graph::CommitGraph::create_commit`].
#[derive(Debug, Clone)]
pub struct NewCommit {
    pub author: String,
    pub message: String,
    pub parent_ids: Vec<CommitId>,
    pub changes: Vec<FileChange>,
    pub timestamp: Option<DateTime<Utc>>,
    pub merge_request: Option<MergeRequestId>,
}

impl NewCommit {
    pub fn new(author: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            message: message.into(),
            parent_ids: Vec::new(),
            changes: Vec::new(),
            timestamp: None,
            merge_request: None,
        }
    }

    pub fn with_parent(mut self, parent: CommitId) -> Self {
        self.parent_ids.push(parent);
        self
    }

    pub fn with_parents(mut self, parents: Vec<CommitId>) -> Self {
        self.parent_ids = parents;
        self
    }

    pub fn with_change(mut self, change: FileChange) -> Self {
        self.changes.push(change);
        self
    }

    pub fn with_changes(mut self, changes: Vec<FileChange>) -> Self {
        self.changes = changes;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn from_merge_request(mut self, id: MergeRequestId) -> Self {
        self.merge_request = Some(id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub repository: RepositoryId,
    pub name: String,
    pub head: CommitId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub created_at: DateTime<Utc>,
}

/// Stored lifecycle of a merge request. Review-driven labels are computed,
/// see [`EffectiveStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeRequestStatus {
    Open,
    Merged,
    Closed,
}

impl MergeRequestStatus {
    pub fn as_str(&self) -> &str {
        match self {
            MergeRequestStatus::Open => "open",
            MergeRequestStatus::Merged => "merged",
            MergeRequestStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(MergeRequestStatus::Open),
            "merged" => Some(MergeRequestStatus::Merged),
            "closed" => Some(MergeRequestStatus::Closed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MergeRequestStatus::Open)
    }
}

impl fmt::Display for MergeRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status as presented to users: the stored status, refined by the latest
/// review of each reviewer while the request is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectiveStatus {
    Open,
    Approved,
    Rejected,
    ChangesRequested,
    Merged,
    Closed,
}

impl EffectiveStatus {
    pub fn as_str(&self) -> &str {
        match self {
            EffectiveStatus::Open => "open",
            EffectiveStatus::Approved => "approved",
            EffectiveStatus::Rejected => "rejected",
            EffectiveStatus::ChangesRequested => "changes_requested",
            EffectiveStatus::Merged => "merged",
            EffectiveStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for EffectiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewDecision {
    Approved,
    Rejected,
    ChangesRequested,
    Commented,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &str {
        match self {
            ReviewDecision::Approved => "approved",
            ReviewDecision::Rejected => "rejected",
            ReviewDecision::ChangesRequested => "changes_requested",
            ReviewDecision::Commented => "commented",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(ReviewDecision::Approved),
            "rejected" => Some(ReviewDecision::Rejected),
            "changes_requested" => Some(ReviewDecision::ChangesRequested),
            "commented" => Some(ReviewDecision::Commented),
            _ => None,
        }
    }

    /// Whether this decision, as a reviewer's latest, prevents merging.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            ReviewDecision::Rejected | ReviewDecision::ChangesRequested
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub merge_request: MergeRequestId,
    pub reviewer: String,
    pub decision: ReviewDecision,
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: MergeRequestId,
    pub repository: RepositoryId,
    pub title: String,
    pub description: String,
    pub creator: String,
    pub source_branch: String,
    pub target_branch: String,
    pub status: MergeRequestStatus,
    pub merge_commit: Option<CommitId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Who merged or closed the request.
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewMergeRequest {
    pub title: String,
    pub description: String,
    pub creator: String,
    pub source_branch: String,
    pub target_branch: String,
}

impl NewMergeRequest {
    pub fn new(
        creator: impl Into<String>,
        title: impl Into<String>,
        source_branch: impl Into<String>,
        target_branch: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            creator: creator.into(),
            source_branch: source_branch.into(),
            target_branch: target_branch.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Source was already contained in target; nothing moved.
    UpToDate,
    FastForward,
    MergeCommit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// The target branch head after the merge.
    pub commit: CommitId,
    pub strategy: MergeStrategy,
}
