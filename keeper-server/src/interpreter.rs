//! Effect interpreter.
//!
//! Executes the effects a pass planned, in order, against the hosting API.

use tracing::{error, info, warn};

use keeper_core::comments;
use keeper_core::effect::LogLevel;
use keeper_core::{Effect, RepoRef};

use crate::api::{ApiError, RepositoryApi};

/// Execute `effects` sequentially.
///
/// A `NotFound` means the target is already gone, so the effect is skipped
/// and execution continues. Any other error stops execution and is returned,
/// leaving the remaining effects for the next pass to plan again.
pub async fn execute_effects(
    api: &dyn RepositoryApi,
    repo: &RepoRef,
    effects: Vec<Effect>,
) -> Result<(), ApiError> {
    for effect in effects {
        match execute_effect(api, repo, effect).await {
            Ok(()) => {}
            Err(ApiError::NotFound(what)) => {
                info!("Skipping effect on {}: {} not found", repo, what);
            }
            Err(e) => {
                error!("Effect execution failed on {}: {}", repo, e);
                return Err(e);
            }
        }
    }
    Ok(())
}

async fn execute_effect(api: &dyn RepositoryApi, repo: &RepoRef, effect: Effect) -> Result<(), ApiError> {
    match effect {
        Effect::AddLabels { number, labels } => api.add_labels(repo, number, &labels).await,
        Effect::RemoveLabel { number, label } => api.remove_label(repo, number, &label).await,
        Effect::Comment { number, body } => api.create_comment(repo, number, &body).await,
        Effect::Close { number } => api.close(repo, number).await,
        Effect::CreateReview {
            number,
            commit_sha,
            body,
            comments: review_comments,
        } => {
            match api
                .create_review(repo, number, &commit_sha, &body, &review_comments)
                .await
            {
                // Inline comments must sit on lines of the diff; post them as
                // one comment when GitHub refuses the review.
                Err(ApiError::Rejected { status: 422, message }) => {
                    warn!(
                        "Review on {}#{} rejected ({}), posting a summary instead",
                        repo, number, message
                    );
                    let summary = comments::review_summary(&body, &review_comments);
                    api.create_comment(repo, number, &summary).await
                }
                other => other,
            }
        }
        Effect::React {
            comment_id,
            reaction,
        } => api.add_reaction(repo, comment_id, reaction).await,
        Effect::CreateClosedIssue { title, body } => {
            let number = api.create_issue(repo, &title, &body).await?;
            api.close(repo, number).await
        }
        Effect::Log { level, message } => {
            match level {
                LogLevel::Info => info!("{}", message),
                LogLevel::Warn => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            }
            Ok(())
        }
    }
}
