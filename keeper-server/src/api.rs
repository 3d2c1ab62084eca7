//! The hosting API as an injected capability.
//!
//! Every pipeline talks to the repository through [`RepositoryApi`]. The
//! production implementation is [`crate::github::GitHubClient`] wrapped in
//! [`crate::retry::RetryingApi`]; tests use an in-memory double.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use keeper_core::effect::Reaction;
use keeper_core::report::ReviewComment;
use keeper_core::snapshot::{CheckStatus, FileChange, PullRequestDetails, ReviewSignal};
use keeper_core::RepoRef;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The request budget is exhausted until `reset_at`.
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },
    /// The resource is gone; callers treat this as already converged.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient failure: {0}")]
    Transient(String),
    /// The API refused the request and will keep refusing it.
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl ApiError {
    /// Errors worth another attempt after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

#[async_trait]
pub trait RepositoryApi: Send + Sync {
    async fn get_pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequestDetails, ApiError>;

    async fn list_changed_files(&self, repo: &RepoRef, number: u64) -> Result<Vec<FileChange>, ApiError>;

    async fn get_file_content(&self, repo: &RepoRef, path: &str, git_ref: &str) -> Result<String, ApiError>;

    async fn list_labels(&self, repo: &RepoRef, number: u64) -> Result<BTreeSet<String>, ApiError>;

    async fn add_labels(&self, repo: &RepoRef, number: u64, labels: &BTreeSet<String>) -> Result<(), ApiError>;

    async fn remove_label(&self, repo: &RepoRef, number: u64, label: &str) -> Result<(), ApiError>;

    async fn create_comment(&self, repo: &RepoRef, number: u64, body: &str) -> Result<(), ApiError>;

    /// Close an issue or pull request.
    async fn close(&self, repo: &RepoRef, number: u64) -> Result<(), ApiError>;

    /// Numbers of the author's open pull requests in the repository.
    async fn list_open_pulls(&self, repo: &RepoRef, author: &str) -> Result<Vec<u64>, ApiError>;

    /// Aggregate CI state of the check runs on `head_sha`.
    async fn get_check_run_status(&self, repo: &RepoRef, head_sha: &str) -> Result<CheckStatus, ApiError>;

    /// Latest decisive maintainer review, and whether `head_sha` is newer than it.
    async fn get_review_state(
        &self,
        repo: &RepoRef,
        number: u64,
        head_sha: &str,
    ) -> Result<ReviewSignal, ApiError>;

    async fn create_review(
        &self,
        repo: &RepoRef,
        number: u64,
        commit_sha: &str,
        body: &str,
        comments: &[ReviewComment],
    ) -> Result<(), ApiError>;

    async fn add_reaction(&self, repo: &RepoRef, comment_id: u64, reaction: Reaction) -> Result<(), ApiError>;

    /// Returns the new issue's number.
    async fn create_issue(&self, repo: &RepoRef, title: &str, body: &str) -> Result<u64, ApiError>;

    /// The open pull request whose head is `sha`, if any.
    async fn find_pull_for_commit(&self, repo: &RepoRef, sha: &str) -> Result<Option<u64>, ApiError>;
}
