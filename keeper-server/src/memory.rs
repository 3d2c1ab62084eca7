//! In-memory implementation of `RepositoryApi`.
//!
//! Holds a small fake repository and records every mutating call so tests
//! can assert exactly which commands a pass issued.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use keeper_core::effect::Reaction;
use keeper_core::report::ReviewComment;
use keeper_core::snapshot::{
    AuthorAssociation, CheckStatus, FileChange, PrState, PullRequestDetails, ReviewSignal,
};
use keeper_core::RepoRef;

use crate::api::{ApiError, RepositoryApi};

/// A mutating call made against the fake repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    AddLabels { number: u64, labels: BTreeSet<String> },
    RemoveLabel { number: u64, label: String },
    Comment { number: u64, body: String },
    Close { number: u64 },
    CreateReview { number: u64, comments: Vec<ReviewComment> },
    React { comment_id: u64, reaction: Reaction },
    CreateIssue { title: String },
}

#[derive(Default)]
struct MemoryState {
    pulls: HashMap<u64, PullRequestDetails>,
    files: HashMap<u64, Vec<FileChange>>,
    contents: HashMap<String, String>,
    slow_paths: HashSet<String>,
    checks: HashMap<String, CheckStatus>,
    reviews: HashMap<u64, ReviewSignal>,
    closed_issues: BTreeSet<u64>,
    next_issue: u64,
    /// Errors returned by the next `get_pull_request` calls.
    failures: VecDeque<ApiError>,
    /// Errors returned by every fetch of these paths.
    content_errors: HashMap<String, ApiError>,
    /// Errors returned by the next `create_comment` calls.
    comment_failures: VecDeque<ApiError>,
    comment_attempts: usize,
    reject_reviews: bool,
    calls: Vec<ApiCall>,
    pull_reads: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryApi {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// An open, non-draft pull request by an outside contributor with a
    /// filled-in template.
    pub fn pull(number: u64, author: &str) -> PullRequestDetails {
        PullRequestDetails {
            number,
            author: author.to_string(),
            author_association: AuthorAssociation::Contributor,
            is_bot: false,
            is_draft: false,
            description: "Adds an algorithm.\n\n- [x] I have read CONTRIBUTING.md".to_string(),
            labels: BTreeSet::new(),
            mergeable: Some(true),
            head_sha: format!("sha-{number}"),
            state: PrState::Open,
            merged: false,
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn insert_pull(&self, pull: PullRequestDetails) {
        self.with(|state| {
            state.pulls.insert(pull.number, pull);
        });
    }

    pub fn update_pull(&self, number: u64, f: impl FnOnce(&mut PullRequestDetails)) {
        self.with(|state| {
            if let Some(pull) = state.pulls.get_mut(&number) {
                f(pull);
            }
        });
    }

    pub fn set_files(&self, number: u64, files: Vec<FileChange>) {
        self.with(|state| {
            state.files.insert(number, files);
        });
    }

    pub fn set_content(&self, path: &str, content: &str) {
        self.with(|state| {
            state.contents.insert(path.to_string(), content.to_string());
        });
    }

    /// Fetching this path never finishes.
    pub fn hang_on(&self, path: &str) {
        self.with(|state| {
            state.slow_paths.insert(path.to_string());
        });
    }

    pub fn set_check_status(&self, sha: &str, status: CheckStatus) {
        self.with(|state| {
            state.checks.insert(sha.to_string(), status);
        });
    }

    pub fn set_review(&self, number: u64, review: ReviewSignal) {
        self.with(|state| {
            state.reviews.insert(number, review);
        });
    }

    pub fn fail_next(&self, errors: Vec<ApiError>) {
        self.with(|state| state.failures.extend(errors));
    }

    pub fn fail_content(&self, path: &str, error: ApiError) {
        self.with(|state| {
            state.content_errors.insert(path.to_string(), error);
        });
    }

    pub fn fail_comments(&self, errors: Vec<ApiError>) {
        self.with(|state| state.comment_failures.extend(errors));
    }

    /// Number of `create_comment` calls, failed ones included.
    pub fn comment_attempts(&self) -> usize {
        self.with(|state| state.comment_attempts)
    }

    pub fn reject_reviews(&self) {
        self.with(|state| state.reject_reviews = true);
    }

    pub fn labels(&self, number: u64) -> BTreeSet<String> {
        self.with(|state| {
            state
                .pulls
                .get(&number)
                .map(|pull| pull.labels.clone())
                .unwrap_or_default()
        })
    }

    pub fn is_closed(&self, number: u64) -> bool {
        self.with(|state| {
            state.closed_issues.contains(&number)
                || state
                    .pulls
                    .get(&number)
                    .is_some_and(|pull| pull.state == PrState::Closed)
        })
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.with(|state| state.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with(|state| state.calls.clear());
    }

    /// Number of `get_pull_request` calls, failed ones included.
    pub fn read_count(&self) -> usize {
        self.with(|state| state.pull_reads)
    }

    fn record(&self, call: ApiCall) {
        self.with(|state| state.calls.push(call));
    }
}

fn not_found(what: impl Into<String>) -> ApiError {
    ApiError::NotFound(what.into())
}

#[async_trait]
impl RepositoryApi for InMemoryApi {
    async fn get_pull_request(&self, _repo: &RepoRef, number: u64) -> Result<PullRequestDetails, ApiError> {
        self.with(|state| {
            state.pull_reads += 1;
            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }
            state
                .pulls
                .get(&number)
                .cloned()
                .ok_or_else(|| not_found(format!("pull request #{number}")))
        })
    }

    async fn list_changed_files(&self, _repo: &RepoRef, number: u64) -> Result<Vec<FileChange>, ApiError> {
        Ok(self.with(|state| state.files.get(&number).cloned().unwrap_or_default()))
    }

    async fn get_file_content(&self, _repo: &RepoRef, path: &str, _git_ref: &str) -> Result<String, ApiError> {
        let hangs = self.with(|state| state.slow_paths.contains(path));
        if hangs {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        }
        self.with(|state| {
            if let Some(error) = state.content_errors.get(path) {
                return Err(error.clone());
            }
            state.contents.get(path).cloned().ok_or_else(|| not_found(path))
        })
    }

    async fn list_labels(&self, _repo: &RepoRef, number: u64) -> Result<BTreeSet<String>, ApiError> {
        self.with(|state| {
            state
                .pulls
                .get(&number)
                .map(|pull| pull.labels.clone())
                .ok_or_else(|| not_found(format!("pull request #{number}")))
        })
    }

    async fn add_labels(&self, _repo: &RepoRef, number: u64, labels: &BTreeSet<String>) -> Result<(), ApiError> {
        self.with(|state| {
            let pull = state
                .pulls
                .get_mut(&number)
                .ok_or_else(|| not_found(format!("pull request #{number}")))?;
            pull.labels.extend(labels.iter().cloned());
            Ok::<(), ApiError>(())
        })?;
        self.record(ApiCall::AddLabels {
            number,
            labels: labels.clone(),
        });
        Ok(())
    }

    async fn remove_label(&self, _repo: &RepoRef, number: u64, label: &str) -> Result<(), ApiError> {
        self.with(|state| {
            let removed = state
                .pulls
                .get_mut(&number)
                .is_some_and(|pull| pull.labels.remove(label));
            if removed {
                Ok(())
            } else {
                Err(not_found(format!("label {label} on #{number}")))
            }
        })?;
        self.record(ApiCall::RemoveLabel {
            number,
            label: label.to_string(),
        });
        Ok(())
    }

    async fn create_comment(&self, _repo: &RepoRef, number: u64, body: &str) -> Result<(), ApiError> {
        self.with(|state| {
            state.comment_attempts += 1;
            match state.comment_failures.pop_front() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })?;
        self.record(ApiCall::Comment {
            number,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn close(&self, _repo: &RepoRef, number: u64) -> Result<(), ApiError> {
        self.with(|state| match state.pulls.get_mut(&number) {
            Some(pull) => pull.state = PrState::Closed,
            None => {
                state.closed_issues.insert(number);
            }
        });
        self.record(ApiCall::Close { number });
        Ok(())
    }

    async fn list_open_pulls(&self, _repo: &RepoRef, author: &str) -> Result<Vec<u64>, ApiError> {
        Ok(self.with(|state| {
            let mut numbers: Vec<u64> = state
                .pulls
                .values()
                .filter(|pull| pull.author == author && pull.state == PrState::Open)
                .map(|pull| pull.number)
                .collect();
            numbers.sort_unstable();
            numbers
        }))
    }

    async fn get_check_run_status(&self, _repo: &RepoRef, head_sha: &str) -> Result<CheckStatus, ApiError> {
        Ok(self.with(|state| {
            state
                .checks
                .get(head_sha)
                .copied()
                .unwrap_or(CheckStatus::Pending)
        }))
    }

    async fn get_review_state(
        &self,
        _repo: &RepoRef,
        number: u64,
        _head_sha: &str,
    ) -> Result<ReviewSignal, ApiError> {
        Ok(self.with(|state| state.reviews.get(&number).copied().unwrap_or_default()))
    }

    async fn create_review(
        &self,
        _repo: &RepoRef,
        number: u64,
        _commit_sha: &str,
        _body: &str,
        comments: &[ReviewComment],
    ) -> Result<(), ApiError> {
        if self.with(|state| state.reject_reviews) {
            return Err(ApiError::Rejected {
                status: 422,
                message: "line must be part of the diff".to_string(),
            });
        }
        self.record(ApiCall::CreateReview {
            number,
            comments: comments.to_vec(),
        });
        Ok(())
    }

    async fn add_reaction(&self, _repo: &RepoRef, comment_id: u64, reaction: Reaction) -> Result<(), ApiError> {
        self.record(ApiCall::React {
            comment_id,
            reaction,
        });
        Ok(())
    }

    async fn create_issue(&self, _repo: &RepoRef, title: &str, _body: &str) -> Result<u64, ApiError> {
        let number = self.with(|state| {
            state.next_issue += 1;
            1000 + state.next_issue
        });
        self.record(ApiCall::CreateIssue {
            title: title.to_string(),
        });
        Ok(number)
    }

    async fn find_pull_for_commit(&self, _repo: &RepoRef, sha: &str) -> Result<Option<u64>, ApiError> {
        Ok(self.with(|state| {
            state
                .pulls
                .values()
                .find(|pull| pull.head_sha == sha && pull.state == PrState::Open)
                .map(|pull| pull.number)
        }))
    }
}
