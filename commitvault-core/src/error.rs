use thiserror::Error;

use crate::models::{CommitId, ContentHash, MergeRequestId, MergeRequestStatus};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupted data in {table}: {reason}")]
    CorruptedData { table: &'static str, reason: String },

    #[error("Content not found: {0}")]
    ContentNotFound(ContentHash),

    #[error("Commit not found: {0}")]
    CommitNotFound(CommitId),

    #[error("Branch not found: {repository}/{name}")]
    BranchNotFound { repository: String, name: String },

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Merge request not found: {0}")]
    MergeRequestNotFound(MergeRequestId),

    #[error("Unknown parent commit: {0}")]
    UnknownParent(CommitId),

    #[error("Invalid parent count: {0} (a commit has 0, 1 or 2 parents)")]
    InvalidParentCount(usize),

    #[error("Duplicate parent commit: {0}")]
    DuplicateParent(CommitId),

    #[error("Invalid file change for {path}: {reason}")]
    InvalidFileChange { path: String, reason: String },

    #[error("Commit already exists: {0}")]
    DuplicateCommit(CommitId),

    #[error("Branch already exists: {repository}/{name}")]
    DuplicateBranchName { repository: String, name: String },

    #[error("Invalid branch name: {0}")]
    InvalidBranchName(String),

    #[error("Repository already exists: {0}")]
    DuplicateRepository(String),

    #[error("Concurrent modification: branch {repository}/{branch} was moved by another writer")]
    ConcurrentModification { repository: String, branch: String },

    #[error("Merge request {id} is already {status}")]
    AlreadyTerminal {
        id: MergeRequestId,
        status: MergeRequestStatus,
    },

    #[error("Merge request {id} is blocked by reviews from: {}", reviewers.join(", "))]
    BlockedByReview {
        id: MergeRequestId,
        reviewers: Vec<String>,
    },

    #[error("Merge conflict on: {}", paths.join(", "))]
    MergeConflict { paths: Vec<String> },

    #[error("Invalid merge request: {0}")]
    InvalidMergeRequest(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

impl Error {
    /// An id or name lookup missed.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ContentNotFound(_)
                | Error::CommitNotFound(_)
                | Error::BranchNotFound { .. }
                | Error::RepositoryNotFound(_)
                | Error::MergeRequestNotFound(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::DuplicateCommit(_)
                | Error::DuplicateBranchName { .. }
                | Error::DuplicateRepository(_)
                | Error::ConcurrentModification { .. }
                | Error::MergeConflict { .. }
        )
    }

    /// The caller may re-read state and try again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::ConcurrentModification { .. })
    }

    /// Failure of the underlying medium rather than a business condition.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Io(_) | Error::Serialization(_) | Error::CorruptedData { .. }
        )
    }
}
