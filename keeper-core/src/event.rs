//! Inbound events and their routing.

use std::fmt;

use crate::snapshot::{AuthorAssociation, IssueSnapshot, PullRequestId};

/// A repository within a GitHub App installation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub installation_id: u64,
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(installation_id: u64, owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            installation_id,
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn pull_request(&self, number: u64) -> PullRequestId {
        PullRequestId::new(&self.owner, &self.name, number)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PullRequest,
    PullRequestReview,
    Issues,
    CheckRun,
    IssueComment,
    Installation,
    InstallationRepositories,
    Ping,
    Other,
}

impl EventKind {
    /// Map the `X-GitHub-Event` header.
    pub fn from_header(name: &str) -> Self {
        match name {
            "pull_request" => EventKind::PullRequest,
            "pull_request_review" => EventKind::PullRequestReview,
            "issues" => EventKind::Issues,
            "check_run" => EventKind::CheckRun,
            "issue_comment" => EventKind::IssueComment,
            "installation" => EventKind::Installation,
            "installation_repositories" => EventKind::InstallationRepositories,
            "ping" => EventKind::Ping,
            _ => EventKind::Other,
        }
    }
}

/// A comment on an issue or pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentEvent {
    pub issue_number: u64,
    pub is_pull_request: bool,
    pub issue_open: bool,
    pub comment_id: u64,
    pub body: String,
    pub author: String,
    pub author_association: AuthorAssociation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    PullRequest { number: u64, sender_is_bot: bool },
    Review { number: u64 },
    Issue(IssueSnapshot),
    CheckRun {
        head_sha: String,
        /// Pull requests GitHub associated with the run. Empty for runs on
        /// forks, in which case the head commit is looked up.
        pull_numbers: Vec<u64>,
    },
    Comment(CommentEvent),
    Installation { repositories: Vec<RepoRef> },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub kind: EventKind,
    pub action: String,
    pub delivery_id: String,
    pub repository: Option<RepoRef>,
    pub payload: Payload,
}

impl EventEnvelope {
    /// Number of the issue or pull request the event is about, if there is
    /// exactly one.
    pub fn subject(&self) -> Option<u64> {
        match &self.payload {
            Payload::PullRequest { number, .. } | Payload::Review { number } => Some(*number),
            Payload::Issue(issue) => Some(issue.number),
            Payload::Comment(comment) => Some(comment.issue_number),
            Payload::CheckRun { .. } | Payload::Installation { .. } | Payload::Empty => None,
        }
    }

    /// A short description for logs.
    pub fn log_summary(&self) -> String {
        let repo = self
            .repository
            .as_ref()
            .map_or_else(|| "-".to_string(), RepoRef::to_string);
        match self.subject() {
            Some(number) => format!("{:?}.{} {}#{}", self.kind, self.action, repo, number),
            None => format!("{:?}.{} {}", self.kind, self.action, repo),
        }
    }
}

/// What a pass does in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    GreetOnInstall,
    PrOpenedOrReady,
    PrUpdated,
    PrClosed,
    IssueOpened,
    CommentCommand,
    CheckRunCompleted,
    ReviewSubmitted,
    Ignored,
}

pub fn route(kind: EventKind, action: &str) -> Route {
    match (kind, action) {
        (EventKind::Installation, "created") | (EventKind::InstallationRepositories, "added") => {
            Route::GreetOnInstall
        }
        (EventKind::PullRequest, "opened" | "reopened" | "ready_for_review") => {
            Route::PrOpenedOrReady
        }
        (EventKind::PullRequest, "synchronize") => Route::PrUpdated,
        (EventKind::PullRequest, "closed") => Route::PrClosed,
        (EventKind::Issues, "opened") => Route::IssueOpened,
        (EventKind::IssueComment, "created") => Route::CommentCommand,
        (EventKind::CheckRun, "completed") => Route::CheckRunCompleted,
        (EventKind::PullRequestReview, "submitted") => Route::ReviewSubmitted,
        _ => Route::Ignored,
    }
}
