//! Event dispatch.
//!
//! Every delivery is claimed in the [`DeliveryLedger`] before any work, and
//! every pull request pass runs under that pull request's lock, including
//! the execution of its effects.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};

use keeper_core::{route, Effect, EventEnvelope, Payload, RepoRef, Route};

use crate::interpreter::execute_effects;
use crate::ledger::{ClaimResult, DeliveryLedger};
use crate::locks::PrLocks;
use crate::pipeline::{PassKind, Pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Processed,
    /// The delivery was already handled or is being handled.
    Duplicate,
    /// Nothing listens to this event.
    Ignored,
    /// The pass failed and the delivery was released for a retry.
    Failed,
}

pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    ledger: DeliveryLedger,
    locks: PrLocks,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<Pipeline>, ledger: DeliveryLedger, locks: PrLocks) -> Self {
        Self {
            pipeline,
            ledger,
            locks,
        }
    }

    pub async fn dispatch(&self, envelope: EventEnvelope) -> DispatchOutcome {
        let route = route(envelope.kind, &envelope.action);
        if route == Route::Ignored {
            debug!("Ignoring {}", envelope.log_summary());
            return DispatchOutcome::Ignored;
        }

        match self.ledger.try_claim(&envelope.delivery_id).await {
            ClaimResult::Claimed => {}
            claim => {
                info!(
                    "Skipping delivery {} ({}): {:?}",
                    envelope.delivery_id,
                    envelope.log_summary(),
                    claim
                );
                return DispatchOutcome::Duplicate;
            }
        }

        info!(
            "Processing delivery {}: {}",
            envelope.delivery_id,
            envelope.log_summary()
        );
        match self.handle(route, &envelope).await {
            Ok(()) => {
                self.ledger.complete(&envelope.delivery_id).await;
                DispatchOutcome::Processed
            }
            Err(e) => {
                error!(
                    "Failed to process delivery {} ({}): {:#}",
                    envelope.delivery_id,
                    envelope.log_summary(),
                    e
                );
                self.ledger.release(&envelope.delivery_id).await;
                DispatchOutcome::Failed
            }
        }
    }

    async fn handle(&self, route: Route, envelope: &EventEnvelope) -> Result<()> {
        match (route, &envelope.payload) {
            (Route::GreetOnInstall, Payload::Installation { repositories }) => {
                for repo in repositories {
                    self.execute(repo, self.pipeline.greeting_pass()).await?;
                }
                Ok(())
            }
            (Route::PrOpenedOrReady, Payload::PullRequest { number, .. }) => {
                let kind = if envelope.action == "opened" {
                    PassKind::Opened
                } else {
                    PassKind::Ready
                };
                self.locked_pass(repository(envelope)?, *number, kind).await
            }
            (
                Route::PrUpdated,
                Payload::PullRequest {
                    number,
                    sender_is_bot,
                },
            ) => {
                // Commits pushed by bots are not analyzed.
                let kind = if *sender_is_bot {
                    PassKind::Light
                } else {
                    PassKind::Updated
                };
                self.locked_pass(repository(envelope)?, *number, kind).await
            }
            (Route::PrClosed, Payload::PullRequest { number, .. }) => {
                let repo = repository(envelope)?;
                let _guard = self.locks.lock(repo.pull_request(*number)).await;
                let effects = self
                    .pipeline
                    .closed_pass(repo, *number)
                    .await
                    .with_context(|| format!("Closed pass on {repo}#{number} failed"))?;
                self.execute(repo, effects).await
            }
            (Route::IssueOpened, Payload::Issue(issue)) => {
                let repo = repository(envelope)?;
                self.execute(repo, self.pipeline.issue_pass(repo, issue)).await
            }
            (Route::CommentCommand, Payload::Comment(comment)) => {
                let repo = repository(envelope)?;
                let _guard = if comment.is_pull_request {
                    Some(self.locks.lock(repo.pull_request(comment.issue_number)).await)
                } else {
                    None
                };
                let effects = self
                    .pipeline
                    .comment_pass(repo, comment)
                    .await
                    .with_context(|| {
                        format!("Command pass on {repo}#{} failed", comment.issue_number)
                    })?;
                self.execute(repo, effects).await
            }
            (
                Route::CheckRunCompleted,
                Payload::CheckRun {
                    head_sha,
                    pull_numbers,
                },
            ) => {
                let repo = repository(envelope)?;
                let numbers = if pull_numbers.is_empty() {
                    self.pipeline
                        .api()
                        .find_pull_for_commit(repo, head_sha)
                        .await
                        .with_context(|| format!("Looking up the pull request for {head_sha} failed"))?
                        .into_iter()
                        .collect()
                } else {
                    pull_numbers.clone()
                };
                // One failing pull request must not starve the others.
                let mut failed = Vec::new();
                for number in numbers {
                    if let Err(e) = self.locked_pass(repo, number, PassKind::Light).await {
                        warn!("Check run pass on {}#{} failed: {:#}", repo, number, e);
                        failed.push(number);
                    }
                }
                if failed.is_empty() {
                    Ok(())
                } else {
                    bail!("Check run passes on {repo} failed for {failed:?}")
                }
            }
            (Route::ReviewSubmitted, Payload::Review { number }) => {
                self.locked_pass(repository(envelope)?, *number, PassKind::Light)
                    .await
            }
            (route, _) => {
                warn!(
                    "Payload of {} does not match route {:?}, ignoring",
                    envelope.log_summary(),
                    route
                );
                Ok(())
            }
        }
    }

    async fn locked_pass(&self, repo: &RepoRef, number: u64, kind: PassKind) -> Result<()> {
        let _guard = self.locks.lock(repo.pull_request(number)).await;
        let effects = self
            .pipeline
            .pull_request_pass(repo, number, kind)
            .await
            .with_context(|| format!("{kind:?} pass on {repo}#{number} failed"))?;
        self.execute(repo, effects).await
    }

    async fn execute(&self, repo: &RepoRef, effects: Vec<Effect>) -> Result<()> {
        execute_effects(self.pipeline.api().as_ref(), repo, effects)
            .await
            .with_context(|| format!("Executing effects on {repo} failed"))
    }
}

fn repository(envelope: &EventEnvelope) -> Result<&RepoRef> {
    envelope
        .repository
        .as_ref()
        .with_context(|| format!("{} carries no repository", envelope.log_summary()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use keeper_core::event::{CommentEvent, EventKind};
    use keeper_core::snapshot::{
        AuthorAssociation, CheckStatus, FileChange, FileStatus, IssueSnapshot, ReviewSignal, ReviewState,
    };
    use keeper_core::Settings;

    use crate::api::ApiError;
    use crate::memory::{ApiCall, InMemoryApi};
    use crate::pipeline::PipelineOptions;

    fn repo() -> RepoRef {
        RepoRef::new(1, "octo", "algos")
    }

    fn dispatcher(api: &InMemoryApi, settings: Settings) -> Dispatcher {
        let pipeline = Pipeline::new(
            Arc::new(api.clone()),
            Arc::new(settings),
            PipelineOptions {
                file_timeout: Duration::from_secs(5),
                mergeable_polls: 0,
                mergeable_delay: Duration::from_millis(10),
            },
        );
        Dispatcher::new(Arc::new(pipeline), DeliveryLedger::default(), PrLocks::new())
    }

    fn envelope(kind: EventKind, action: &str, delivery: &str, payload: Payload) -> EventEnvelope {
        EventEnvelope {
            kind,
            action: action.to_string(),
            delivery_id: delivery.to_string(),
            repository: Some(repo()),
            payload,
        }
    }

    fn pull_request(action: &str, delivery: &str, number: u64) -> EventEnvelope {
        envelope(
            EventKind::PullRequest,
            action,
            delivery,
            Payload::PullRequest {
                number,
                sender_is_bot: false,
            },
        )
    }

    fn check_run(delivery: &str, head_sha: &str, pull_numbers: Vec<u64>) -> EventEnvelope {
        envelope(
            EventKind::CheckRun,
            "completed",
            delivery,
            Payload::CheckRun {
                head_sha: head_sha.to_string(),
                pull_numbers,
            },
        )
    }

    fn review_submitted(delivery: &str, number: u64) -> EventEnvelope {
        envelope(
            EventKind::PullRequestReview,
            "submitted",
            delivery,
            Payload::Review { number },
        )
    }

    fn comment(delivery: &str, body: &str, association: AuthorAssociation, is_pull_request: bool) -> EventEnvelope {
        envelope(
            EventKind::IssueComment,
            "created",
            delivery,
            Payload::Comment(CommentEvent {
                issue_number: 1,
                is_pull_request,
                issue_open: true,
                comment_id: 55,
                body: body.to_string(),
                author: "maintainer".to_string(),
                author_association: association,
            }),
        )
    }

    fn set(labels: &[&str]) -> BTreeSet<String> {
        labels.iter().map(|label| label.to_string()).collect()
    }

    fn count(calls: &[ApiCall], wanted: impl Fn(&ApiCall) -> bool) -> usize {
        calls.iter().filter(|call| wanted(call)).count()
    }

    #[tokio::test]
    async fn test_redelivered_event_is_processed_once() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));
        let dispatcher = dispatcher(&api, Settings::default());

        let event = pull_request("opened", "d-1", 1);
        assert_eq!(dispatcher.dispatch(event.clone()).await, DispatchOutcome::Processed);
        let calls = api.calls();
        assert!(!calls.is_empty());

        assert_eq!(dispatcher.dispatch(event).await, DispatchOutcome::Duplicate);
        assert_eq!(api.calls(), calls);
    }

    #[tokio::test]
    async fn test_invalid_pull_request_is_closed_with_one_comment() {
        let api = InMemoryApi::new();
        let mut pull = InMemoryApi::pull(1, "alice");
        pull.description = "   ".to_string();
        api.insert_pull(pull);

        dispatcher(&api, Settings::default())
            .dispatch(pull_request("opened", "d-1", 1))
            .await;

        let calls = api.calls();
        assert_eq!(calls.len(), 2, "{calls:?}");
        assert!(matches!(&calls[0], ApiCall::Comment { number: 1, body } if body.contains("@alice")));
        assert_eq!(calls[1], ApiCall::Close { number: 1 });
        assert!(api.labels(1).is_empty());
    }

    #[tokio::test]
    async fn test_second_pull_request_closed_at_limit_one() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));
        api.insert_pull(InMemoryApi::pull(2, "alice"));
        let settings = Settings {
            max_pr_by_user: 1,
            ..Settings::default()
        };

        dispatcher(&api, settings)
            .dispatch(pull_request("opened", "d-2", 2))
            .await;

        let calls = api.calls();
        assert!(matches!(&calls[0], ApiCall::Comment { number: 2, body } if body.contains("#1, #2")));
        assert_eq!(calls[1], ApiCall::Close { number: 2 });
        assert!(api.is_closed(2));
        assert!(!api.is_closed(1));
    }

    #[tokio::test]
    async fn test_zero_limit_never_closes() {
        let api = InMemoryApi::new();
        for number in 1..=5 {
            api.insert_pull(InMemoryApi::pull(number, "alice"));
        }

        dispatcher(&api, Settings::default())
            .dispatch(pull_request("opened", "d-5", 5))
            .await;

        assert_eq!(count(&api.calls(), |call| matches!(call, ApiCall::Close { .. })), 0);
    }

    #[tokio::test]
    async fn test_untyped_public_function_is_labeled_and_reviewed() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));
        api.set_files(1, vec![FileChange::new("maths/add.py", FileStatus::Added)]);
        api.set_content(
            "maths/add.py",
            "def add(first: int, second: int):\n    return first + second\n",
        );

        dispatcher(&api, Settings::default())
            .dispatch(pull_request("opened", "d-1", 1))
            .await;

        let labels = api.labels(1);
        assert!(labels.contains("Require: Type hints"), "{labels:?}");
        assert!(labels.contains("Status: awaiting reviews"));
        assert!(!labels.contains("Require: Descriptive names"));

        let reviews: Vec<ApiCall> = api
            .calls()
            .into_iter()
            .filter(|call| matches!(call, ApiCall::CreateReview { .. }))
            .collect();
        assert_eq!(reviews.len(), 1);
        let ApiCall::CreateReview { comments, .. } = &reviews[0] else {
            unreachable!();
        };
        assert!(comments
            .iter()
            .any(|comment| comment.path == "maths/add.py" && comment.body.contains("return type hint")));
    }

    #[tokio::test]
    async fn test_tests_failing_then_passing_restores_labels() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));
        let dispatcher = dispatcher(&api, Settings::default());

        dispatcher.dispatch(pull_request("opened", "d-1", 1)).await;
        let initial = api.labels(1);

        api.set_check_status("sha-1", CheckStatus::Failing);
        dispatcher.dispatch(check_run("d-2", "sha-1", vec![1])).await;
        assert!(api.labels(1).contains("Status: Tests are failing"));

        api.set_check_status("sha-1", CheckStatus::Passing);
        dispatcher.dispatch(check_run("d-3", "sha-1", vec![1])).await;
        assert_eq!(api.labels(1), initial);
    }

    #[tokio::test]
    async fn test_check_run_without_pull_requests_looks_up_head() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(3, "alice"));
        api.set_check_status("sha-3", CheckStatus::Failing);

        dispatcher(&api, Settings::default())
            .dispatch(check_run("d-1", "sha-3", Vec::new()))
            .await;

        assert!(api.labels(3).contains("Status: Tests are failing"));
    }

    #[tokio::test]
    async fn test_changes_requested_then_approved() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));
        let dispatcher = dispatcher(&api, Settings::default());
        dispatcher.dispatch(pull_request("opened", "d-1", 1)).await;
        assert!(api.labels(1).contains("Status: awaiting reviews"));

        api.set_review(1, ReviewSignal::new(ReviewState::ChangesRequested, false));
        dispatcher.dispatch(review_submitted("d-2", 1)).await;
        assert!(api.labels(1).contains("Status: awaiting changes"));
        assert!(!api.labels(1).contains("Status: awaiting reviews"));

        api.set_review(1, ReviewSignal::new(ReviewState::Approved, false));
        dispatcher.dispatch(review_submitted("d-3", 1)).await;
        let labels = api.labels(1);
        assert!(!labels.contains("Status: awaiting changes"));
        assert!(!labels.contains("Status: awaiting reviews"));
    }

    #[tokio::test]
    async fn test_push_after_changes_requested_awaits_review() {
        let api = InMemoryApi::new();
        let mut pull = InMemoryApi::pull(1, "alice");
        pull.labels = set(&["Status: awaiting changes"]);
        api.insert_pull(pull);
        api.set_review(1, ReviewSignal::new(ReviewState::ChangesRequested, true));

        dispatcher(&api, Settings::default())
            .dispatch(pull_request("synchronize", "d-1", 1))
            .await;

        assert!(api.labels(1).contains("Status: awaiting reviews"));
        assert!(!api.labels(1).contains("Status: awaiting changes"));
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_add_labels_once() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));
        let dispatcher = dispatcher(&api, Settings::default());

        let (first, second) = tokio::join!(
            dispatcher.dispatch(pull_request("opened", "d-1", 1)),
            dispatcher.dispatch(check_run("d-2", "sha-1", vec![1])),
        );
        assert_eq!(first, DispatchOutcome::Processed);
        assert_eq!(second, DispatchOutcome::Processed);
        assert_eq!(
            count(&api.calls(), |call| matches!(call, ApiCall::AddLabels { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_pass_releases_claim() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));
        api.fail_next(vec![ApiError::Transient("connection reset".to_string())]);
        let dispatcher = dispatcher(&api, Settings::default());

        let event = pull_request("opened", "d-1", 1);
        assert_eq!(dispatcher.dispatch(event.clone()).await, DispatchOutcome::Failed);
        assert!(api.calls().is_empty());

        assert_eq!(dispatcher.dispatch(event).await, DispatchOutcome::Processed);
        assert!(api.labels(1).contains("Status: awaiting reviews"));
    }

    #[tokio::test]
    async fn test_check_run_failure_does_not_skip_other_pull_requests() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));
        api.insert_pull(InMemoryApi::pull(2, "bob"));
        api.fail_next(vec![ApiError::Unexpected("malformed response".to_string())]);
        let dispatcher = dispatcher(&api, Settings::default());

        let event = check_run("d-1", "sha-shared", vec![1, 2]);
        assert_eq!(dispatcher.dispatch(event.clone()).await, DispatchOutcome::Failed);
        assert!(api.labels(1).is_empty());
        assert!(api.labels(2).contains("Status: awaiting reviews"), "{:?}", api.labels(2));

        // The delivery was released, so a redelivery catches up on #1.
        assert_eq!(dispatcher.dispatch(event).await, DispatchOutcome::Processed);
        assert!(api.labels(1).contains("Status: awaiting reviews"));
    }

    #[tokio::test]
    async fn test_authorized_command_is_acknowledged_and_run() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));

        dispatcher(&api, Settings::default())
            .dispatch(comment(
                "d-1",
                "@algorithms-keeper review-all",
                AuthorAssociation::Member,
                true,
            ))
            .await;

        let calls = api.calls();
        assert_eq!(
            calls[0],
            ApiCall::React {
                comment_id: 55,
                reaction: keeper_core::effect::Reaction::ThumbsUp
            }
        );
        assert!(api.labels(1).contains("Status: awaiting reviews"));
    }

    #[tokio::test]
    async fn test_command_from_contributor_is_ignored() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));

        dispatcher(&api, Settings::default())
            .dispatch(comment(
                "d-1",
                "@algorithms-keeper review",
                AuthorAssociation::Contributor,
                true,
            ))
            .await;

        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_command_on_plain_issue_is_refused() {
        let api = InMemoryApi::new();

        dispatcher(&api, Settings::default())
            .dispatch(comment(
                "d-1",
                "@algorithms-keeper review",
                AuthorAssociation::Owner,
                false,
            ))
            .await;

        assert_eq!(
            api.calls(),
            vec![ApiCall::React {
                comment_id: 55,
                reaction: keeper_core::effect::Reaction::ThumbsDown
            }]
        );
    }

    #[tokio::test]
    async fn test_unrecognized_command_gets_help() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));

        dispatcher(&api, Settings::default())
            .dispatch(comment("d-1", "@algorithms-keeper lint", AuthorAssociation::Owner, true))
            .await;

        let calls = api.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], ApiCall::Comment { body, .. } if body.contains("`lint`")));
    }

    #[tokio::test]
    async fn test_draft_is_left_alone() {
        let api = InMemoryApi::new();
        let mut pull = InMemoryApi::pull(1, "alice");
        pull.is_draft = true;
        pull.description = String::new();
        api.insert_pull(pull);

        dispatcher(&api, Settings::default())
            .dispatch(pull_request("opened", "d-1", 1))
            .await;

        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_issue_is_closed() {
        let api = InMemoryApi::new();
        let event = envelope(
            EventKind::Issues,
            "opened",
            "d-1",
            Payload::Issue(IssueSnapshot {
                number: 9,
                author: "bob".to_string(),
                body: String::new(),
            }),
        );

        dispatcher(&api, Settings::default()).dispatch(event).await;

        let calls = api.calls();
        assert!(matches!(&calls[0], ApiCall::Comment { number: 9, body } if body.contains("@bob")));
        assert_eq!(calls[1], ApiCall::Close { number: 9 });
    }

    #[tokio::test]
    async fn test_installation_greets_every_repository() {
        let api = InMemoryApi::new();
        let event = EventEnvelope {
            kind: EventKind::Installation,
            action: "created".to_string(),
            delivery_id: "d-1".to_string(),
            repository: None,
            payload: Payload::Installation {
                repositories: vec![RepoRef::new(1, "octo", "algos"), RepoRef::new(1, "octo", "sorts")],
            },
        };

        dispatcher(&api, Settings::default()).dispatch(event).await;

        let calls = api.calls();
        assert_eq!(count(&calls, |call| matches!(call, ApiCall::CreateIssue { .. })), 2);
        assert_eq!(count(&calls, |call| matches!(call, ApiCall::Close { .. })), 2);
    }

    #[tokio::test]
    async fn test_ignored_events_are_not_claimed() {
        let api = InMemoryApi::new();
        let dispatcher = dispatcher(&api, Settings::default());
        let event = pull_request("labeled", "d-1", 1);
        assert_eq!(dispatcher.dispatch(event.clone()).await, DispatchOutcome::Ignored);
        assert_eq!(dispatcher.dispatch(event).await, DispatchOutcome::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_timeout_fails_the_file_not_the_pass() {
        let api = InMemoryApi::new();
        api.insert_pull(InMemoryApi::pull(1, "alice"));
        api.set_files(1, vec![FileChange::new("maths/slow.py", FileStatus::Added)]);
        api.hang_on("maths/slow.py");

        let outcome = dispatcher(&api, Settings::default())
            .dispatch(pull_request("synchronize", "d-1", 1))
            .await;

        assert_eq!(outcome, DispatchOutcome::Processed);
        let labels = api.labels(1);
        assert!(labels.contains("Require: Tests"));
        assert!(labels.contains("Require: Type hints"));
        assert!(labels.contains("Require: Descriptive names"));
    }
}
