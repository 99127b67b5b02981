//! # commitvault-core
//!
//! Embedded version-control core: a content-addressed blob store, an
//! append-only commit graph, compare-and-swap branch pointers, file-change
//! reconciliation and a merge-request workflow, persisted in SQLite.
//!
//! ```no_run
//! use commitvault_core::{FileState, RepositoryId, Vault};
//!
//! let vault = Vault::open("vault.db").unwrap();
//! let repo = RepositoryId::new("capstone-7");
//! vault.repositories().create(&repo).unwrap();
//!
//! let hash = vault.store_file(b"# Proposal\n").unwrap();
//! let state = FileState::new().with_file("proposal.md", hash);
//! vault.commit_snapshot(&repo, "main", "student-12", "Add proposal", &state).unwrap();
//! ```

pub mod branches;
pub mod content;
pub mod error;
pub mod graph;
pub mod merge;
pub mod models;
pub mod reconcile;
pub mod repositories;
pub mod storage;
pub mod vault;

pub use branches::BranchManager;
pub use content::ContentStore;
pub use error::{Error, Result};
pub use graph::{Ancestors, CommitGraph};
pub use merge::MergeRequestEngine;
pub use models::{
    Branch, BranchId, ChangeKind, Commit, CommitId, ContentHash, EffectiveStatus, FileChange,
    MergeOutcome, MergeRequest, MergeRequestId, MergeRequestStatus, MergeStrategy, NewCommit,
    NewMergeRequest, Repository, RepositoryId, Review, ReviewDecision, ReviewId,
};
pub use reconcile::{changes_between, FileState};
pub use repositories::Repositories;
pub use storage::Storage;
pub use vault::Vault;
