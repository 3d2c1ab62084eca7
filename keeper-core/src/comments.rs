//! Text of every comment the bot posts.

use crate::policy::InvalidReason;
use crate::quota::QuotaVerdict;
use crate::report::{summarize, ReviewComment};

pub fn invalid_pull_request(author: &str, reason: &InvalidReason) -> String {
    let explanation = match reason {
        InvalidReason::MissingDescription => {
            "the description is empty. Please open a new pull request with the template \
             properly filled out."
                .to_string()
        }
        InvalidReason::NoChecklistAcknowledged => {
            "none of the checkboxes in the template have been marked. Go through the \
             checklist one point at a time and mark the relevant ones by putting an `x` \
             between the brackets, like so: `[x]`."
                .to_string()
        }
        InvalidReason::ExtensionlessFiles(paths) => format!(
            "the following files have no extension:\n\n{}",
            bullet_list(paths)
        ),
        InvalidReason::UnsupportedExtensions(paths) => format!(
            "the following files have an extension this repository does not accept:\n\n{}",
            bullet_list(paths)
        ),
    };
    format!(
        "# Closing this pull request as invalid\n\n\
         @{author}, this pull request is being closed because {explanation}\n\n\
         If you believe this was done by mistake, please read the contributing guidelines \
         before opening a new pull request."
    )
}

pub fn invalid_issue(author: &str) -> String {
    format!(
        "# Closing this issue as invalid\n\n\
         @{author}, this issue is being closed because the description is empty. \
         Please open a new issue that describes the problem."
    )
}

pub fn quota_exceeded(author: &str, max_allowed: usize, verdict: &QuotaVerdict) -> String {
    let plural = if max_allowed == 1 { "" } else { "s" };
    format!(
        "# Multiple pull requests opened\n\n\
         @{author}, this pull request is being closed because a contributor can only have \
         {max_allowed} open pull request{plural} at a time. Please focus on the pull \
         requests you already have open before opening another one.\n\n\
         Open pull requests (including this one): {}",
        verdict.open_list()
    )
}

/// Body of the review posted alongside inline comments.
pub fn review_report(author: &str) -> String {
    format!(
        "# Pull request report\n\n\
         @{author}, thank you for the contribution. I found a few things in the submitted \
         files that need attention; please go through the comments below and update the \
         pull request."
    )
}

/// Fallback when inline comments cannot be attached to the diff: the review
/// body followed by every comment as a list.
pub fn review_summary(review_body: &str, comments: &[ReviewComment]) -> String {
    format!("{review_body}\n\n{}", summarize(comments))
}

pub fn unrecognized_command(attempted: &str, mention: &str) -> String {
    let attempted = if attempted.is_empty() {
        "(no command)".to_string()
    } else {
        format!("`{attempted}`")
    };
    format!(
        "I did not recognize {attempted}. Available commands:\n\n\
         * `{mention} review` checks the files this pull request adds\n\
         * `{mention} review-all` checks every changed file and updates the labels"
    )
}

pub fn greeting() -> (String, String) {
    (
        "Installation successful!".to_string(),
        "Thank you for installing the bot. It will check new pull requests and issues \
         against the contribution policy and keep their labels up to date.\n\n\
         This issue is closed automatically."
            .to_string(),
    )
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("* `{item}`"))
        .collect::<Vec<_>>()
        .join("\n")
}
