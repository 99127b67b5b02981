use crate::branches::BranchManager;
use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::graph::CommitGraph;
use crate::merge::MergeRequestEngine;
use crate::models::{CommitId, ContentHash, NewCommit, RepositoryId};
use crate::reconcile::{changes_between, FileState};
use crate::repositories::Repositories;
use crate::storage::Storage;
use std::path::Path;
use tracing::info;

/// All components wired over one storage handle.
///
/// `Vault` is cheap to clone and safe to share between threads.
#[derive(Clone)]
pub struct Vault {
    content: ContentStore,
    graph: CommitGraph,
    branches: BranchManager,
    repositories: Repositories,
    merge_requests: MergeRequestEngine,
}

impl Vault {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        Ok(Self::with_storage(Storage::new(db_path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::with_storage(Storage::in_memory()?))
    }

    pub fn with_storage(storage: Storage) -> Self {
        let graph = CommitGraph::new(storage.clone());
        let branches = BranchManager::new(storage.clone());
        let content = ContentStore::new(storage.clone());
        Self {
            repositories: Repositories::new(storage.clone()),
            merge_requests: MergeRequestEngine::new(
                storage,
                content.clone(),
                graph.clone(),
                branches.clone(),
            ),
            content,
            graph,
            branches,
        }
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn graph(&self) -> &CommitGraph {
        &self.graph
    }

    pub fn branches(&self) -> &BranchManager {
        &self.branches
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    pub fn merge_requests(&self) -> &MergeRequestEngine {
        &self.merge_requests
    }

    pub fn store_file(&self, content: &[u8]) -> Result<ContentHash> {
        self.content.put(content)
    }

    /// Files at the head of `branch`.
    pub fn branch_state(&self, repository: &RepositoryId, branch: &str) -> Result<FileState> {
        let head = self.branches.get_head(repository, branch)?;
        self.graph.file_state(&head)
    }

    /// Records `state` as the next commit on `branch` and advances the branch.
    ///
    /// File changes are derived against the current head. A branch that does
    /// not exist yet is created with a root commit. Every hash in the
    /// resulting changes must already be in the content store. If the branch
    /// moves before the commit lands this returns `ConcurrentModification`;
    /// the unreferenced commit stays in the graph.
    pub fn commit_snapshot(
        &self,
        repository: &RepositoryId,
        branch: &str,
        author: &str,
        message: &str,
        state: &FileState,
    ) -> Result<CommitId> {
        let head = match self.branches.get_head(repository, branch) {
            Ok(head) => Some(head),
            Err(Error::BranchNotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let parent_state = match &head {
            Some(head) => self.graph.file_state(head)?,
            None => FileState::new(),
        };

        let changes = changes_between(&parent_state, state);
        for hash in changes.iter().filter_map(|c| c.new_hash.as_ref()) {
            if !self.content.contains(hash)? {
                return Err(Error::ContentNotFound(hash.clone()));
            }
        }

        let mut commit = NewCommit::new(author, message).with_changes(changes);
        if let Some(head) = &head {
            commit = commit.with_parent(head.clone());
        }
        let id = self.graph.create_commit(repository, commit)?;

        match head {
            Some(head) => self.branches.advance_head(repository, branch, &head, &id)?,
            None => match self.branches.create_branch(repository, branch, &id) {
                Ok(_) => info!("Started branch {}/{} with root commit", repository, branch),
                Err(Error::DuplicateBranchName { .. }) => {
                    return Err(Error::ConcurrentModification {
                        repository: repository.to_string(),
                        branch: branch.to_string(),
                    })
                }
                Err(e) => return Err(e),
            },
        }

        Ok(id)
    }
}
