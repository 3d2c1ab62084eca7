//! Structural policy for pull requests and issues.
//!
//! Rules are checked in a fixed order and the first failing rule decides the
//! verdict, so the same snapshot always yields the same reason.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::settings::Settings;
use crate::snapshot::{FileChange, FileStatus, IssueSnapshot, PullRequestSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Draft pull requests are left alone until they are ready for review.
    Neutral,
    Valid,
    Invalid {
        reason: InvalidReason,
        should_close: bool,
    },
}

impl Verdict {
    fn invalid(reason: InvalidReason) -> Self {
        Verdict::Invalid {
            reason,
            should_close: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    MissingDescription,
    NoChecklistAcknowledged,
    /// Paths of every evaluated file without an extension.
    ExtensionlessFiles(Vec<String>),
    /// Paths of every evaluated file whose extension is not accepted.
    UnsupportedExtensions(Vec<String>),
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::MissingDescription => write!(f, "missing description"),
            InvalidReason::NoChecklistAcknowledged => write!(f, "no checklist acknowledged"),
            InvalidReason::ExtensionlessFiles(_) => write!(f, "extensionless file"),
            InvalidReason::UnsupportedExtensions(_) => write!(f, "unsupported extension"),
        }
    }
}

/// Files subject to the structural checks: not removed and not excluded.
fn evaluated_files<'a>(
    snapshot: &'a PullRequestSnapshot,
    settings: &'a Settings,
) -> impl Iterator<Item = &'a FileChange> + 'a {
    snapshot
        .changed_files
        .iter()
        .filter(|file| file.status != FileStatus::Removed)
        .filter(|file| !settings.is_excluded(&file.path))
}

pub fn evaluate(snapshot: &PullRequestSnapshot, settings: &Settings) -> Verdict {
    if snapshot.is_draft {
        return Verdict::Neutral;
    }

    if snapshot.is_member_or_owner || snapshot.is_bot {
        return Verdict::Valid;
    }

    if snapshot.description.trim().is_empty() {
        return Verdict::invalid(InvalidReason::MissingDescription);
    }

    if snapshot.checklist.has_checkboxes && snapshot.checklist.checked_boxes.is_empty() {
        return Verdict::invalid(InvalidReason::NoChecklistAcknowledged);
    }

    let extensionless: Vec<String> = evaluated_files(snapshot, settings)
        .filter(|file| file.extension.is_none() && !file.is_root_dotfile())
        .map(|file| file.path.clone())
        .collect();
    if !extensionless.is_empty() {
        return Verdict::invalid(InvalidReason::ExtensionlessFiles(extensionless));
    }

    if !settings.accepted_extensions.is_empty() {
        let unsupported: Vec<String> = evaluated_files(snapshot, settings)
            .filter(|file| {
                file.extension.as_deref().is_some_and(|ext| {
                    !settings
                        .accepted_extensions
                        .iter()
                        .any(|accepted| accepted.trim_start_matches('.').eq_ignore_ascii_case(ext))
                })
            })
            .map(|file| file.path.clone())
            .collect();
        if !unsupported.is_empty() {
            return Verdict::invalid(InvalidReason::UnsupportedExtensions(unsupported));
        }
    }

    Verdict::Valid
}

/// Issues only need a body.
pub fn evaluate_issue(issue: &IssueSnapshot) -> Verdict {
    if issue.body.trim().is_empty() {
        Verdict::invalid(InvalidReason::MissingDescription)
    } else {
        Verdict::Valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrKind {
    Documentation,
    Enhancement,
}

/// Classify a pull request by the files it touches.
pub fn pr_kind(files: &[FileChange], settings: &Settings) -> Option<PrKind> {
    let is_docs = files.iter().any(|file| {
        file.extension
            .as_deref()
            .is_some_and(|ext| settings.docs_extensions.iter().any(|docs| docs == ext))
            && !settings
                .generated_files
                .iter()
                .any(|generated| generated == file.file_name())
    });
    if is_docs {
        return Some(PrKind::Documentation);
    }
    if files.iter().any(|file| file.status != FileStatus::Added) {
        return Some(PrKind::Enhancement);
    }
    None
}
