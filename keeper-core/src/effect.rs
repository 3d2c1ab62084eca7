//! Effects (side effects as data).
//!
//! Planning code produces effects; the server's interpreter executes them
//! against the hosting API. Keeping them as data lets the decision logic be
//! tested without any HTTP.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::reconcile::LabelPlan;
use crate::report::ReviewComment;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    AddLabels {
        number: u64,
        labels: BTreeSet<String>,
    },
    RemoveLabel {
        number: u64,
        label: String,
    },
    /// Comment on an issue or pull request.
    Comment {
        number: u64,
        body: String,
    },
    /// Close an issue or pull request.
    Close {
        number: u64,
    },
    /// A pull request review with inline comments on the head commit.
    CreateReview {
        number: u64,
        commit_sha: String,
        body: String,
        comments: Vec<ReviewComment>,
    },
    React {
        comment_id: u64,
        reaction: Reaction,
    },
    /// Open an issue and close it straight away, leaving a notice in the
    /// repository history.
    CreateClosedIssue {
        title: String,
        body: String,
    },
    Log {
        level: LogLevel,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reaction {
    ThumbsUp,
    ThumbsDown,
}

impl Reaction {
    /// The `content` value GitHub expects.
    pub fn as_github(self) -> &'static str {
        match self {
            Reaction::ThumbsUp => "+1",
            Reaction::ThumbsDown => "-1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl Effect {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Effect::Log {
            level,
            message: message.into(),
        }
    }

    /// Whether the effect changes repository state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Effect::Log { .. })
    }
}

/// Effects for a label plan, in the order they must run: the explanation is
/// posted before anything is closed.
pub fn plan_effects(number: u64, plan: &LabelPlan) -> Vec<Effect> {
    let mut effects = Vec::new();
    if let Some(body) = &plan.comment {
        effects.push(Effect::Comment {
            number,
            body: body.clone(),
        });
    }
    effects.extend(plan.remove.iter().map(|label| Effect::RemoveLabel {
        number,
        label: label.clone(),
    }));
    if !plan.add.is_empty() {
        effects.push(Effect::AddLabels {
            number,
            labels: plan.add.clone(),
        });
    }
    if plan.close {
        effects.push(Effect::Close { number });
    }
    effects
}
