//! Merge request review and merge workflow.
//!
//! A request is stored as `Open`, `Merged` or `Closed`. While open, its
//! displayed status is derived from the latest review of each reviewer, so a
//! reviewer who changes their mind immediately unblocks (or blocks) merging.
//! Approval is not required: a request is mergeable when no reviewer's latest
//! decision is `Rejected` or `ChangesRequested`.

use crate::branches::{compare_and_swap, find_branch, BranchManager};
use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::graph::CommitGraph;
use crate::models::{
    CommitId, EffectiveStatus, MergeOutcome, MergeRequest, MergeRequestId, MergeRequestStatus,
    MergeStrategy, NewCommit, NewMergeRequest, RepositoryId, Review, ReviewDecision, ReviewId,
};
use crate::reconcile::{changes_between, merge_states, FileState};
use crate::repositories::ensure_live;
use crate::storage::{
    format_timestamp, invalid_column, optional_timestamp_column, timestamp_column, Storage,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use tracing::{debug, info, warn};

const MERGE_REQUEST_COLUMNS: &str = "id, repository_id, title, description, creator, source_branch,
    target_branch, status, merge_commit, created_at, updated_at, resolved_by, resolved_at";

#[derive(Clone)]
pub struct MergeRequestEngine {
    storage: Storage,
    content: ContentStore,
    graph: CommitGraph,
    branches: BranchManager,
}

impl MergeRequestEngine {
    pub fn new(
        storage: Storage,
        content: ContentStore,
        graph: CommitGraph,
        branches: BranchManager,
    ) -> Self {
        Self {
            storage,
            content,
            graph,
            branches,
        }
    }

    /// Opens a request to merge `source_branch` into `target_branch`.
    ///
    /// Several open requests for the same pair are allowed; each is resolved
    /// on its own.
    pub fn open(&self, repository: &RepositoryId, request: NewMergeRequest) -> Result<MergeRequestId> {
        if request.source_branch == request.target_branch {
            return Err(Error::InvalidMergeRequest(format!(
                "source and target are both '{}'",
                request.source_branch
            )));
        }

        let id = MergeRequestId::new();
        let now = format_timestamp(&Utc::now());

        self.storage.write(|tx| {
            ensure_live(tx, repository)?;
            for name in [&request.source_branch, &request.target_branch] {
                if find_branch(tx, repository, name)?.is_none() {
                    return Err(Error::BranchNotFound {
                        repository: repository.to_string(),
                        name: name.clone(),
                    });
                }
            }

            tx.execute(
                "INSERT INTO merge_requests (id, repository_id, title, description, creator,
                     source_branch, target_branch, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id.to_string(),
                    repository.as_str(),
                    request.title,
                    request.description,
                    request.creator,
                    request.source_branch,
                    request.target_branch,
                    MergeRequestStatus::Open.as_str(),
                    now,
                ],
            )?;
            Ok(())
        })?;

        info!(
            "Opened merge request {} ({} -> {}) in {}",
            id, request.source_branch, request.target_branch, repository
        );
        Ok(id)
    }

    pub fn get(&self, id: &MergeRequestId) -> Result<MergeRequest> {
        self.storage.read(|conn| load_merge_request(conn, id))
    }

    pub fn list(
        &self,
        repository: &RepositoryId,
        status: Option<MergeRequestStatus>,
    ) -> Result<Vec<MergeRequest>> {
        self.storage.read(|conn| {
            ensure_live(conn, repository)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM merge_requests
                 WHERE repository_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at, id",
                MERGE_REQUEST_COLUMNS
            ))?;
            let requests = stmt
                .query_map(
                    params![repository.as_str(), status.map(|s| s.as_str().to_string())],
                    merge_request_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(requests)
        })
    }

    /// Appends a review. Does not change the stored status.
    pub fn submit_review(
        &self,
        id: &MergeRequestId,
        reviewer: &str,
        decision: ReviewDecision,
        comment: Option<String>,
    ) -> Result<ReviewId> {
        let review_id = ReviewId::new();

        self.storage.write(|tx| {
            let request = load_merge_request(tx, id)?;
            if request.status.is_terminal() {
                return Err(Error::AlreadyTerminal {
                    id: *id,
                    status: request.status,
                });
            }

            tx.execute(
                "INSERT INTO reviews (id, merge_request_id, reviewer, decision, comment, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    review_id.to_string(),
                    id.to_string(),
                    reviewer,
                    decision.as_str(),
                    comment,
                    format_timestamp(&Utc::now()),
                ],
            )?;
            Ok(())
        })?;

        info!("{} reviewed {}: {}", reviewer, id, decision.as_str());
        Ok(review_id)
    }

    /// The full review log, oldest first.
    pub fn reviews(&self, id: &MergeRequestId) -> Result<Vec<Review>> {
        self.storage.read(|conn| {
            load_merge_request(conn, id)?;
            load_reviews(conn, id)
        })
    }

    /// The most recent review of each reviewer, in log order.
    pub fn latest_reviews(&self, id: &MergeRequestId) -> Result<Vec<Review>> {
        let reviews = self.reviews(id)?;
        Ok(latest_per_reviewer(&reviews).into_iter().cloned().collect())
    }

    /// Reviewers whose latest decision blocks a merge.
    pub fn blocking_reviewers(&self, id: &MergeRequestId) -> Result<Vec<String>> {
        self.storage.read(|conn| {
            load_merge_request(conn, id)?;
            blocking_reviewers_in(conn, id)
        })
    }

    pub fn effective_status(&self, id: &MergeRequestId) -> Result<EffectiveStatus> {
        let request = self.get(id)?;
        let reviews = self.reviews(id)?;
        Ok(effective_status(request.status, &latest_per_reviewer(&reviews)))
    }

    /// Merges the request's source branch into its target branch.
    ///
    /// When the target head is an ancestor of the source head the target is
    /// fast-forwarded and no commit is created. When the source is already
    /// contained in the target nothing moves. Otherwise a merge commit with
    /// parents `[target_head, source_head]` is created from `resolved`, or,
    /// if no state is supplied, from a path-level union of both sides that
    /// fails with [`Error::MergeConflict`] when they disagree. Every blob the
    /// merge commit introduces must already be in the content store.
    ///
    /// The target branch moves by compare-and-swap in the same transaction
    /// that marks the request merged. If the target moved concurrently this
    /// returns `ConcurrentModification` and the request stays open.
    pub fn merge(
        &self,
        id: &MergeRequestId,
        merged_by: &str,
        resolved: Option<FileState>,
    ) -> Result<MergeOutcome> {
        let request = self.get(id)?;
        if request.status.is_terminal() {
            return Err(Error::AlreadyTerminal {
                id: *id,
                status: request.status,
            });
        }
        self.ensure_unblocked(id)?;

        let repository = &request.repository;
        let source_head = self.branches.get_head(repository, &request.source_branch)?;
        let target_head = self.branches.get_head(repository, &request.target_branch)?;

        let (new_head, strategy) = if self.graph.is_ancestor(&source_head, &target_head)? {
            (target_head.clone(), MergeStrategy::UpToDate)
        } else if self.graph.is_ancestor(&target_head, &source_head)? {
            (source_head.clone(), MergeStrategy::FastForward)
        } else {
            let commit =
                self.synthesize(&request, &target_head, &source_head, merged_by, resolved)?;
            (commit, MergeStrategy::MergeCommit)
        };

        self.storage.write(|tx| {
            let blocking = blocking_reviewers_in(tx, id)?;
            if !blocking.is_empty() {
                return Err(Error::BlockedByReview {
                    id: *id,
                    reviewers: blocking,
                });
            }

            compare_and_swap(
                tx,
                repository,
                &request.target_branch,
                &target_head,
                &new_head,
            )?;

            let now = format_timestamp(&Utc::now());
            let updated = tx.execute(
                "UPDATE merge_requests
                 SET status = ?1, merge_commit = ?2, resolved_by = ?3, resolved_at = ?4, updated_at = ?4
                 WHERE id = ?5 AND status = ?6",
                params![
                    MergeRequestStatus::Merged.as_str(),
                    new_head.as_str(),
                    merged_by,
                    now,
                    id.to_string(),
                    MergeRequestStatus::Open.as_str(),
                ],
            )?;

            if updated == 0 {
                let current = load_merge_request(tx, id)?;
                return Err(Error::AlreadyTerminal {
                    id: *id,
                    status: current.status,
                });
            }
            Ok(())
        })?;

        info!(
            "Merged {} ({} -> {}) as {:?}, target now at {}",
            id,
            request.source_branch,
            request.target_branch,
            strategy,
            new_head.short()
        );

        Ok(MergeOutcome {
            commit: new_head,
            strategy,
        })
    }

    /// Closes the request without touching any branch.
    pub fn close(&self, id: &MergeRequestId, closed_by: &str) -> Result<()> {
        self.storage.write(|tx| {
            let now = format_timestamp(&Utc::now());
            let updated = tx.execute(
                "UPDATE merge_requests
                 SET status = ?1, resolved_by = ?2, resolved_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    MergeRequestStatus::Closed.as_str(),
                    closed_by,
                    now,
                    id.to_string(),
                    MergeRequestStatus::Open.as_str(),
                ],
            )?;

            if updated == 0 {
                let current = load_merge_request(tx, id)?;
                return Err(Error::AlreadyTerminal {
                    id: *id,
                    status: current.status,
                });
            }
            Ok(())
        })?;

        info!("{} closed merge request {}", closed_by, id);
        Ok(())
    }

    fn ensure_unblocked(&self, id: &MergeRequestId) -> Result<()> {
        let blocking = self.blocking_reviewers(id)?;
        if blocking.is_empty() {
            return Ok(());
        }

        warn!("Merge of {} blocked by {:?}", id, blocking);
        Err(Error::BlockedByReview {
            id: *id,
            reviewers: blocking,
        })
    }

    fn synthesize(
        &self,
        request: &MergeRequest,
        target_head: &CommitId,
        source_head: &CommitId,
        merged_by: &str,
        resolved: Option<FileState>,
    ) -> Result<CommitId> {
        let target_state = self.graph.file_state(target_head)?;

        let merged_state = match resolved {
            Some(state) => state,
            None => {
                let base_state = match self.graph.merge_base(target_head, source_head)? {
                    Some(base) => self.graph.file_state(&base)?,
                    None => FileState::new(),
                };
                let source_state = self.graph.file_state(source_head)?;
                merge_states(&base_state, &target_state, &source_state)?
            }
        };

        let changes = changes_between(&target_state, &merged_state);
        for hash in changes.iter().filter_map(|c| c.new_hash.as_ref()) {
            if !self.content.contains(hash)? {
                return Err(Error::ContentNotFound(hash.clone()));
            }
        }
        debug!(
            "Synthesizing merge commit for {} with {} change(s)",
            request.id,
            changes.len()
        );

        let message = format!(
            "Merge branch '{}' into '{}'\n\n{}",
            request.source_branch, request.target_branch, request.title
        );

        self.graph.create_commit(
            &request.repository,
            NewCommit::new(merged_by, message)
                .with_parents(vec![target_head.clone(), source_head.clone()])
                .with_changes(changes)
                .from_merge_request(request.id),
        )
    }
}

/// Keeps the last review of each reviewer from a log ordered oldest first.
pub fn latest_per_reviewer(reviews: &[Review]) -> Vec<&Review> {
    let mut latest: HashMap<&str, usize> = HashMap::new();
    for (idx, review) in reviews.iter().enumerate() {
        latest.insert(review.reviewer.as_str(), idx);
    }

    let mut indices: Vec<usize> = latest.into_values().collect();
    indices.sort_unstable();
    indices.into_iter().map(|idx| &reviews[idx]).collect()
}

/// Derives the displayed status. Terminal states win; otherwise the
/// strongest latest decision decides, with `Rejected` over
/// `ChangesRequested` over `Approved`. Comments never change the status.
pub fn effective_status(stored: MergeRequestStatus, latest: &[&Review]) -> EffectiveStatus {
    match stored {
        MergeRequestStatus::Merged => return EffectiveStatus::Merged,
        MergeRequestStatus::Closed => return EffectiveStatus::Closed,
        MergeRequestStatus::Open => {}
    }

    let has = |decision: ReviewDecision| latest.iter().any(|r| r.decision == decision);

    if has(ReviewDecision::Rejected) {
        EffectiveStatus::Rejected
    } else if has(ReviewDecision::ChangesRequested) {
        EffectiveStatus::ChangesRequested
    } else if has(ReviewDecision::Approved) {
        EffectiveStatus::Approved
    } else {
        EffectiveStatus::Open
    }
}

fn blocking_reviewers_in(conn: &Connection, id: &MergeRequestId) -> Result<Vec<String>> {
    let reviews = load_reviews(conn, id)?;
    Ok(latest_per_reviewer(&reviews)
        .into_iter()
        .filter(|r| r.decision.is_blocking())
        .map(|r| r.reviewer.clone())
        .collect())
}

fn load_merge_request(conn: &Connection, id: &MergeRequestId) -> Result<MergeRequest> {
    conn.query_row(
        &format!("SELECT {} FROM merge_requests WHERE id = ?1", MERGE_REQUEST_COLUMNS),
        params![id.to_string()],
        merge_request_from_row,
    )
    .optional()?
    .ok_or(Error::MergeRequestNotFound(*id))
}

fn load_reviews(conn: &Connection, id: &MergeRequestId) -> Result<Vec<Review>> {
    let mut stmt = conn.prepare(
        "SELECT id, merge_request_id, reviewer, decision, comment, timestamp
         FROM reviews WHERE merge_request_id = ?1 ORDER BY seq",
    )?;
    let reviews = stmt
        .query_map(params![id.to_string()], review_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(reviews)
}

fn merge_request_from_row(row: &Row) -> rusqlite::Result<MergeRequest> {
    let id: String = row.get(0)?;
    let repository: String = row.get(1)?;
    let status: String = row.get(7)?;
    let merge_commit: Option<String> = row.get(8)?;

    Ok(MergeRequest {
        id: MergeRequestId::parse(&id).map_err(|_| invalid_column(0, "merge request id", &id))?,
        repository: RepositoryId::new(repository),
        title: row.get(2)?,
        description: row.get(3)?,
        creator: row.get(4)?,
        source_branch: row.get(5)?,
        target_branch: row.get(6)?,
        status: MergeRequestStatus::parse(&status)
            .ok_or_else(|| invalid_column(7, "merge request status", &status))?,
        merge_commit: merge_commit.map(CommitId::new),
        created_at: timestamp_column(row, 9)?,
        updated_at: timestamp_column(row, 10)?,
        resolved_by: row.get(11)?,
        resolved_at: optional_timestamp_column(row, 12)?,
    })
}

fn review_from_row(row: &Row) -> rusqlite::Result<Review> {
    let id: String = row.get(0)?;
    let merge_request: String = row.get(1)?;
    let decision: String = row.get(3)?;

    Ok(Review {
        id: ReviewId::parse(&id).map_err(|_| invalid_column(0, "review id", &id))?,
        merge_request: MergeRequestId::parse(&merge_request)
            .map_err(|_| invalid_column(1, "merge request id", &merge_request))?,
        reviewer: row.get(2)?,
        decision: ReviewDecision::parse(&decision)
            .ok_or_else(|| invalid_column(3, "review decision", &decision))?,
        comment: row.get(4)?,
        timestamp: timestamp_column(row, 5)?,
    })
}
