//! Processing passes.
//!
//! A pass reads fresh repository state through the injected
//! [`RepositoryApi`], runs the pure decision code from `keeper_core`, and
//! returns the effects to execute. Nothing here mutates the repository.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use keeper_core::analyzer::{analyze, is_analyzable, AnalysisResult, AnalysisScope};
use keeper_core::command::{try_authorize, Authorization, KeeperCommand};
use keeper_core::comments;
use keeper_core::effect::{plan_effects, LogLevel, Reaction};
use keeper_core::event::CommentEvent;
use keeper_core::policy::{evaluate, evaluate_issue, pr_kind, Verdict};
use keeper_core::quota::check_quota;
use keeper_core::reconcile::{closed_plan, reconcile, Signals, Validity};
use keeper_core::report::PullRequestReport;
use keeper_core::snapshot::{
    FileChange, IssueSnapshot, PrState, PullRequestDetails, PullRequestSnapshot, ReviewSignal,
};
use keeper_core::{Effect, RepoRef, Settings};

use crate::api::{ApiError, RepositoryApi};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Upper bound on fetching and analyzing a single file.
    pub file_timeout: Duration,
    /// Extra reads of a pull request whose mergeability is still being computed.
    pub mergeable_polls: u32,
    /// Poll `n` waits `n * mergeable_delay`.
    pub mergeable_delay: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            file_timeout: Duration::from_secs(20),
            mergeable_polls: 4,
            mergeable_delay: Duration::from_secs(1),
        }
    }
}

/// Why a pull request pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// The pull request was just opened. The only pass that checks the quota.
    Opened,
    /// Reopened or marked ready for review.
    Ready,
    /// New commits were pushed.
    Updated,
    /// CI or a review changed; labels only, no analysis.
    Light,
    Command(KeeperCommand),
}

impl PassKind {
    fn analysis_scope(self) -> Option<AnalysisScope> {
        match self {
            PassKind::Opened | PassKind::Ready | PassKind::Updated => Some(AnalysisScope::AddedOnly),
            PassKind::Light => None,
            PassKind::Command(command) => Some(command.scope()),
        }
    }

    fn posts_review(self) -> bool {
        match self {
            PassKind::Opened | PassKind::Ready => true,
            PassKind::Updated | PassKind::Light => false,
            PassKind::Command(command) => command.posts_review(),
        }
    }
}

pub struct Pipeline {
    api: Arc<dyn RepositoryApi>,
    settings: Arc<Settings>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(api: Arc<dyn RepositoryApi>, settings: Arc<Settings>, options: PipelineOptions) -> Self {
        Self {
            api,
            settings,
            options,
        }
    }

    pub fn api(&self) -> &Arc<dyn RepositoryApi> {
        &self.api
    }

    /// Re-read the pull request while GitHub is still computing whether it
    /// merges cleanly.
    async fn fetch_pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequestDetails, ApiError> {
        let mut details = self.api.get_pull_request(repo, number).await?;
        for poll in 1..=self.options.mergeable_polls {
            if details.mergeable.is_some() || details.state != PrState::Open {
                break;
            }
            debug!("Mergeability of {}#{} unknown, polling ({})", repo, number, poll);
            tokio::time::sleep(self.options.mergeable_delay * poll).await;
            details = self.api.get_pull_request(repo, number).await?;
        }
        Ok(details)
    }

    /// Evaluate, analyze and reconcile one pull request.
    pub async fn pull_request_pass(
        &self,
        repo: &RepoRef,
        number: u64,
        kind: PassKind,
    ) -> Result<Vec<Effect>, ApiError> {
        let details = match self.fetch_pull_request(repo, number).await {
            Ok(details) => details,
            Err(ApiError::NotFound(what)) => {
                return Ok(vec![Effect::log(
                    LogLevel::Info,
                    format!("{repo}#{number} is gone ({what}), nothing to do"),
                )]);
            }
            Err(e) => return Err(e),
        };
        if details.state != PrState::Open {
            return Ok(vec![Effect::log(
                LogLevel::Info,
                format!("{repo}#{number} is closed, skipping {kind:?} pass"),
            )]);
        }

        let files = self.api.list_changed_files(repo, number).await?;
        let snapshot = PullRequestSnapshot::new(details, files);
        let labels = &self.settings.labels;

        match evaluate(&snapshot, &self.settings) {
            Verdict::Neutral => {
                return Ok(vec![Effect::log(
                    LogLevel::Info,
                    format!("{repo}#{number} is a draft, leaving it alone"),
                )]);
            }
            Verdict::Invalid {
                reason,
                should_close,
            } => {
                info!("{}#{} is invalid: {}", repo, number, reason);
                let current = self.api.list_labels(repo, number).await?;
                let signals = Signals {
                    validity: Validity::Invalid {
                        comment: comments::invalid_pull_request(&snapshot.author, &reason),
                    },
                    ..Signals::valid(ReviewSignal::default())
                };
                let mut plan = reconcile(&current, &signals, labels);
                plan.close = should_close;
                return Ok(plan_effects(number, &plan));
            }
            Verdict::Valid => {}
        }

        if kind == PassKind::Opened {
            if let Some(effects) = self.enforce_quota(repo, &snapshot).await? {
                return Ok(effects);
            }
        }

        let report = match kind.analysis_scope() {
            Some(scope) if !snapshot.is_bot => Some(self.analyze_files(repo, &snapshot, scope).await?),
            _ => None,
        };

        let tests_passing = self
            .api
            .get_check_run_status(repo, &snapshot.head_sha)
            .await?
            .tests_passing();
        let review = self
            .api
            .get_review_state(repo, number, &snapshot.head_sha)
            .await?;
        let current = self.api.list_labels(repo, number).await?;

        let signals = Signals {
            validity: Validity::Valid,
            tests_passing,
            review,
            has_conflicts: snapshot.has_conflicts(),
            requirements: report.as_ref().map(PullRequestReport::requirements),
            kind: pr_kind(&snapshot.changed_files, &self.settings),
        };
        let plan = reconcile(&current, &signals, labels);
        let mut effects = plan_effects(number, &plan);

        if let Some(report) = report.filter(|report| kind.posts_review() && report.has_violations()) {
            effects.push(Effect::CreateReview {
                number,
                commit_sha: snapshot.head_sha.clone(),
                body: comments::review_report(&snapshot.author),
                comments: report.review_comments(),
            });
        }

        effects.push(Effect::log(
            LogLevel::Info,
            format!(
                "{repo}#{number} {kind:?} pass: +{:?} -{:?}",
                plan.add, plan.remove
            ),
        ));
        Ok(effects)
    }

    /// Close the pull request when it pushes its author over the limit.
    async fn enforce_quota(
        &self,
        repo: &RepoRef,
        snapshot: &PullRequestSnapshot,
    ) -> Result<Option<Vec<Effect>>, ApiError> {
        let max_allowed = self.settings.max_pr_by_user;
        if max_allowed == 0 || snapshot.is_member_or_owner || snapshot.is_bot {
            return Ok(None);
        }
        let open = self.api.list_open_pulls(repo, &snapshot.author).await?;
        let verdict = check_quota(snapshot.number, &open, max_allowed);
        // A newer pull request closes itself in its own pass.
        if !verdict.exceeded || verdict.close != Some(snapshot.number) {
            return Ok(None);
        }
        info!(
            "{} has {} open pull requests in {}, closing #{}",
            snapshot.author,
            verdict.open.len(),
            repo,
            snapshot.number
        );
        Ok(Some(vec![
            Effect::Comment {
                number: snapshot.number,
                body: comments::quota_exceeded(&snapshot.author, max_allowed, &verdict),
            },
            Effect::Close {
                number: snapshot.number,
            },
        ]))
    }

    async fn analyze_files(
        &self,
        repo: &RepoRef,
        snapshot: &PullRequestSnapshot,
        scope: AnalysisScope,
    ) -> Result<PullRequestReport, ApiError> {
        let mut results = Vec::new();
        for file in snapshot
            .changed_files
            .iter()
            .filter(|file| is_analyzable(file, scope, &self.settings))
        {
            results.push(self.analyze_file(repo, &snapshot.head_sha, file).await?);
        }
        info!(
            "Analyzed {} file(s) of {}#{}",
            results.len(),
            repo,
            snapshot.number
        );
        Ok(PullRequestReport::new(results, &snapshot.changed_files, &self.settings))
    }

    /// Fetch and analyze one file. A file that cannot be fetched, parsed or
    /// analyzed in time fails every check instead of failing the pass. Only
    /// an exhausted rate limit aborts the pass.
    async fn analyze_file(
        &self,
        repo: &RepoRef,
        head_sha: &str,
        file: &FileChange,
    ) -> Result<AnalysisResult, ApiError> {
        let work = async {
            let source = match self.api.get_file_content(repo, &file.path, head_sha).await {
                Ok(source) => source,
                Err(ApiError::NotFound(_)) => {
                    return Ok(AnalysisResult::failed(
                        &file.path,
                        1,
                        "The file could not be fetched from the head commit.",
                    ));
                }
                // Only the budget is worth failing the whole pass for.
                Err(e @ ApiError::RateLimited { .. }) => return Err(e),
                Err(e) => {
                    warn!("Fetching {} from {} failed: {}", file.path, repo, e);
                    return Ok(AnalysisResult::failed(
                        &file.path,
                        1,
                        format!("The file could not be fetched: {e}"),
                    ));
                }
            };
            let settings = self.settings.clone();
            let path = file.path.clone();
            let analyzed = tokio::task::spawn_blocking(move || analyze(&path, &source, &settings)).await;
            Ok(match analyzed {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => e.into_result(&file.path),
                Err(e) => AnalysisResult::failed(&file.path, 1, format!("Analysis aborted: {e}")),
            })
        };

        match tokio::time::timeout(self.options.file_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Analysis of {} in {} timed out after {:?}",
                    file.path, repo, self.options.file_timeout
                );
                Ok(AnalysisResult::failed(
                    &file.path,
                    1,
                    format!(
                        "Analysis timed out after {} seconds.",
                        self.options.file_timeout.as_secs()
                    ),
                ))
            }
        }
    }

    /// Drop the review-status labels of a merged pull request.
    pub async fn closed_pass(&self, repo: &RepoRef, number: u64) -> Result<Vec<Effect>, ApiError> {
        let details = match self.api.get_pull_request(repo, number).await {
            Ok(details) => details,
            Err(ApiError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let current = self.api.list_labels(repo, number).await?;
        let plan = closed_plan(&current, details.merged, &self.settings.labels);
        Ok(plan_effects(number, &plan))
    }

    /// Close issues opened without a description.
    pub fn issue_pass(&self, repo: &RepoRef, issue: &IssueSnapshot) -> Vec<Effect> {
        match evaluate_issue(issue) {
            Verdict::Invalid { reason, .. } => vec![
                Effect::log(
                    LogLevel::Info,
                    format!("Closing {}#{}: {}", repo, issue.number, reason),
                ),
                Effect::Comment {
                    number: issue.number,
                    body: comments::invalid_issue(&issue.author),
                },
                Effect::Close {
                    number: issue.number,
                },
            ],
            Verdict::Valid | Verdict::Neutral => Vec::new(),
        }
    }

    /// Act on a bot mention in a comment.
    pub async fn comment_pass(&self, repo: &RepoRef, comment: &CommentEvent) -> Result<Vec<Effect>, ApiError> {
        let command = match try_authorize(
            &comment.body,
            comment.author_association,
            &self.settings.commands,
        ) {
            Authorization::Ignored => return Ok(Vec::new()),
            Authorization::Unrecognized { attempted } => {
                if !comment.is_pull_request || !comment.issue_open {
                    return Ok(Vec::new());
                }
                return Ok(vec![Effect::Comment {
                    number: comment.issue_number,
                    body: comments::unrecognized_command(&attempted, &self.settings.commands.mention),
                }]);
            }
            Authorization::Authorized(command) => command.command(),
        };

        if !comment.is_pull_request {
            return Ok(vec![Effect::React {
                comment_id: comment.comment_id,
                reaction: Reaction::ThumbsDown,
            }]);
        }
        if !comment.issue_open {
            return Ok(vec![Effect::log(
                LogLevel::Info,
                format!(
                    "Ignoring `{}` on closed {}#{}",
                    command, repo, comment.issue_number
                ),
            )]);
        }

        info!(
            "{} asked for `{}` on {}#{}",
            comment.author, command, repo, comment.issue_number
        );
        let mut effects = vec![Effect::React {
            comment_id: comment.comment_id,
            reaction: Reaction::ThumbsUp,
        }];
        effects.extend(
            self.pull_request_pass(repo, comment.issue_number, PassKind::Command(command))
                .await?,
        );
        Ok(effects)
    }

    /// The notice left in a repository the app was just installed on.
    pub fn greeting_pass(&self) -> Vec<Effect> {
        let (title, body) = comments::greeting();
        vec![Effect::CreateClosedIssue { title, body }]
    }
}
