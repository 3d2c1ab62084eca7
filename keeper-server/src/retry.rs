//! Retries and the shared request budget.
//!
//! [`RateBudget`] caps how many requests every pipeline together may send per
//! window; the GitHub client draws from it before each request.
//! [`RetryingApi`] wraps any [`RepositoryApi`] so that transient failures are
//! retried with bounded exponential backoff and rate limiting pauses the
//! shared budget until the reset time. Calls that create comments, reviews,
//! reactions or issues are only retried after a rate limit.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use keeper_core::effect::Reaction;
use keeper_core::report::ReviewComment;
use keeper_core::snapshot::{CheckStatus, FileChange, PullRequestDetails, ReviewSignal};
use keeper_core::RepoRef;

use crate::api::{ApiError, RepositoryApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Longest single wait for a rate-limit reset.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_rate_limit_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: `base * 2^(attempt - 1)`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

struct BudgetWindow {
    started: Instant,
    used: u32,
    paused_until: Option<Instant>,
}

/// Fixed-window request budget shared by every pipeline.
pub struct RateBudget {
    capacity: u32,
    window: Duration,
    state: Mutex<BudgetWindow>,
}

impl RateBudget {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            state: Mutex::new(BudgetWindow {
                started: Instant::now(),
                used: 0,
                paused_until: None,
            }),
        }
    }

    pub fn per_hour(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(3600))
    }

    /// Take one request from the budget, waiting for the next window (or the
    /// end of a pause) when none is left.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                match state.paused_until {
                    Some(until) if until > now => until - now,
                    _ => {
                        state.paused_until = None;
                        if now.duration_since(state.started) >= self.window {
                            state.started = now;
                            state.used = 0;
                        }
                        if state.used < self.capacity {
                            state.used += 1;
                            return;
                        }
                        (state.started + self.window).saturating_duration_since(now)
                    }
                }
            };
            warn!("Request budget exhausted, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Hold every request until `wait` has passed.
    pub async fn pause_for(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut state = self.state.lock().await;
        match state.paused_until {
            Some(current) if current >= until => {}
            _ => state.paused_until = Some(until),
        }
    }

    /// Requests still available in the current window.
    pub async fn remaining(&self) -> u32 {
        let state = self.state.lock().await;
        if Instant::now().duration_since(state.started) >= self.window {
            self.capacity
        } else {
            self.capacity.saturating_sub(state.used)
        }
    }
}

/// [`RepositoryApi`] decorator adding retries.
pub struct RetryingApi<A> {
    inner: A,
    policy: RetryPolicy,
    budget: Arc<RateBudget>,
}

impl<A: RepositoryApi> RetryingApi<A> {
    pub fn new(inner: A, policy: RetryPolicy, budget: Arc<RateBudget>) -> Self {
        Self {
            inner,
            policy,
            budget,
        }
    }

    async fn run<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ApiError>> + Send,
        T: Send,
    {
        self.attempt(operation, true, call).await
    }

    /// For calls that create something. A transient failure may have landed
    /// on the server, so only a rate limit, which the API answers before
    /// acting, is retried.
    async fn run_creating<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ApiError>> + Send,
        T: Send,
    {
        self.attempt(operation, false, call).await
    }

    async fn attempt<T, F, Fut>(&self, operation: &str, retry_transient: bool, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ApiError>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            let error = match call().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if attempt >= self.policy.max_attempts {
                warn!("{} failed after {} attempts: {}", operation, attempt, error);
                return Err(error);
            }
            match &error {
                ApiError::RateLimited { reset_at } => {
                    let wait = (*reset_at - Utc::now())
                        .to_std()
                        .unwrap_or_default()
                        .min(self.policy.max_rate_limit_wait);
                    info!(
                        "{} rate limited (attempt {}), pausing requests for {:?}",
                        operation, attempt, wait
                    );
                    self.budget.pause_for(wait).await;
                    tokio::time::sleep(wait).await;
                }
                ApiError::Transient(message) if retry_transient => {
                    let delay = self.policy.backoff_delay(attempt);
                    warn!(
                        "{} failed (attempt {}): {}; retrying in {:?}",
                        operation, attempt, message, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(error),
            }
            attempt += 1;
        }
    }
}

#[async_trait]
impl<A: RepositoryApi> RepositoryApi for RetryingApi<A> {
    async fn get_pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequestDetails, ApiError> {
        self.run("get_pull_request", || self.inner.get_pull_request(repo, number))
            .await
    }

    async fn list_changed_files(&self, repo: &RepoRef, number: u64) -> Result<Vec<FileChange>, ApiError> {
        self.run("list_changed_files", || {
            self.inner.list_changed_files(repo, number)
        })
        .await
    }

    async fn get_file_content(&self, repo: &RepoRef, path: &str, git_ref: &str) -> Result<String, ApiError> {
        self.run("get_file_content", || {
            self.inner.get_file_content(repo, path, git_ref)
        })
        .await
    }

    async fn list_labels(&self, repo: &RepoRef, number: u64) -> Result<BTreeSet<String>, ApiError> {
        self.run("list_labels", || self.inner.list_labels(repo, number))
            .await
    }

    async fn add_labels(&self, repo: &RepoRef, number: u64, labels: &BTreeSet<String>) -> Result<(), ApiError> {
        self.run("add_labels", || self.inner.add_labels(repo, number, labels))
            .await
    }

    async fn remove_label(&self, repo: &RepoRef, number: u64, label: &str) -> Result<(), ApiError> {
        self.run("remove_label", || self.inner.remove_label(repo, number, label))
            .await
    }

    async fn create_comment(&self, repo: &RepoRef, number: u64, body: &str) -> Result<(), ApiError> {
        self.run_creating("create_comment", || {
            self.inner.create_comment(repo, number, body)
        })
        .await
    }

    async fn close(&self, repo: &RepoRef, number: u64) -> Result<(), ApiError> {
        self.run("close", || self.inner.close(repo, number)).await
    }

    async fn list_open_pulls(&self, repo: &RepoRef, author: &str) -> Result<Vec<u64>, ApiError> {
        self.run("list_open_pulls", || self.inner.list_open_pulls(repo, author))
            .await
    }

    async fn get_check_run_status(&self, repo: &RepoRef, head_sha: &str) -> Result<CheckStatus, ApiError> {
        self.run("get_check_run_status", || {
            self.inner.get_check_run_status(repo, head_sha)
        })
        .await
    }

    async fn get_review_state(
        &self,
        repo: &RepoRef,
        number: u64,
        head_sha: &str,
    ) -> Result<ReviewSignal, ApiError> {
        self.run("get_review_state", || {
            self.inner.get_review_state(repo, number, head_sha)
        })
        .await
    }

    async fn create_review(
        &self,
        repo: &RepoRef,
        number: u64,
        commit_sha: &str,
        body: &str,
        comments: &[ReviewComment],
    ) -> Result<(), ApiError> {
        self.run_creating("create_review", || {
            self.inner
                .create_review(repo, number, commit_sha, body, comments)
        })
        .await
    }

    async fn add_reaction(&self, repo: &RepoRef, comment_id: u64, reaction: Reaction) -> Result<(), ApiError> {
        self.run_creating("add_reaction", || {
            self.inner.add_reaction(repo, comment_id, reaction)
        })
        .await
    }

    async fn create_issue(&self, repo: &RepoRef, title: &str, body: &str) -> Result<u64, ApiError> {
        self.run_creating("create_issue", || self.inner.create_issue(repo, title, body))
            .await
    }

    async fn find_pull_for_commit(&self, repo: &RepoRef, sha: &str) -> Result<Option<u64>, ApiError> {
        self.run("find_pull_for_commit", || {
            self.inner.find_pull_for_commit(repo, sha)
        })
        .await
    }
}
