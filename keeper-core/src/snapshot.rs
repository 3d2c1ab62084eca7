//! Per-pass views of repository state.
//!
//! Every value here is built fresh from the hosting API for a single
//! processing pass and dropped once the resulting effects are executed.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// The relationship of a user to the repository, as reported by GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorAssociation {
    Owner,
    Member,
    Collaborator,
    Contributor,
    FirstTimeContributor,
    FirstTimer,
    Mannequin,
    #[serde(other)]
    None,
}

impl AuthorAssociation {
    /// Owners and members bypass the structural pull request checks.
    pub fn is_member_or_owner(self) -> bool {
        matches!(self, AuthorAssociation::Owner | AuthorAssociation::Member)
    }

    /// Parse the association names used in configuration (`owner`, `member`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "owner" => Some(AuthorAssociation::Owner),
            "member" => Some(AuthorAssociation::Member),
            "collaborator" => Some(AuthorAssociation::Collaborator),
            "contributor" => Some(AuthorAssociation::Contributor),
            "first_time_contributor" => Some(AuthorAssociation::FirstTimeContributor),
            "first_timer" => Some(AuthorAssociation::FirstTimer),
            "mannequin" => Some(AuthorAssociation::Mannequin),
            "none" => Some(AuthorAssociation::None),
            _ => None,
        }
    }
}

/// Unique identifier for a pull request across repositories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PullRequestId {
    pub repo_owner: String,
    pub repo_name: String,
    pub pr_number: u64,
}

impl PullRequestId {
    pub fn new(repo_owner: impl Into<String>, repo_name: impl Into<String>, pr_number: u64) -> Self {
        Self {
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
            pr_number,
        }
    }
}

impl fmt::Display for PullRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.repo_owner, self.repo_name, self.pr_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Renamed,
}

impl FileStatus {
    /// Map GitHub's file status strings. `copied`, `changed` and `unchanged`
    /// are treated as modifications.
    pub fn from_github(status: &str) -> Self {
        match status {
            "added" => FileStatus::Added,
            "removed" => FileStatus::Removed,
            "renamed" => FileStatus::Renamed,
            _ => FileStatus::Modified,
        }
    }
}

/// A file touched by a pull request. Contents are fetched separately, and
/// only for files selected for analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub extension: Option<String>,
    pub status: FileStatus,
}

impl FileChange {
    pub fn new(path: impl Into<String>, status: FileStatus) -> Self {
        let path = path.into();
        let extension = Path::new(&path)
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .map(|ext| ext.to_ascii_lowercase());
        Self {
            path,
            extension,
            status,
        }
    }

    /// The final path component.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// A dotfile such as `.gitignore` sitting at the repository root.
    pub fn is_root_dotfile(&self) -> bool {
        !self.path.contains('/') && self.path.starts_with('.')
    }

    pub fn is_under(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.path.starts_with(prefix)
    }
}

/// Task-list items found in a pull request description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checklist {
    pub has_checkboxes: bool,
    pub checked_boxes: BTreeSet<String>,
}

impl Checklist {
    /// Collect Markdown task-list items (`- [ ] text`, `* [x] text`).
    pub fn parse(description: &str) -> Self {
        let mut checklist = Checklist::default();
        for line in description.lines() {
            let trimmed = line.trim_start();
            let Some(item) = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
                .or_else(|| trimmed.strip_prefix("+ "))
            else {
                continue;
            };
            let item = item.trim_start();
            let Some(rest) = item.strip_prefix('[') else {
                continue;
            };
            let mut chars = rest.chars();
            let (Some(mark), Some(']')) = (chars.next(), chars.next()) else {
                continue;
            };
            match mark {
                ' ' => checklist.has_checkboxes = true,
                'x' | 'X' => {
                    checklist.has_checkboxes = true;
                    checklist
                        .checked_boxes
                        .insert(chars.as_str().trim().to_string());
                }
                _ => {}
            }
        }
        checklist
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
}

/// Pull request metadata as returned by the hosting API, before the changed
/// files are listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDetails {
    pub number: u64,
    pub author: String,
    pub author_association: AuthorAssociation,
    pub is_bot: bool,
    pub is_draft: bool,
    pub description: String,
    pub labels: BTreeSet<String>,
    pub mergeable: Option<bool>,
    pub head_sha: String,
    pub state: PrState,
    pub merged: bool,
}

/// Everything the policy evaluator and reconciler need to know about a pull
/// request for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSnapshot {
    pub number: u64,
    pub author: String,
    pub is_draft: bool,
    pub is_member_or_owner: bool,
    pub is_bot: bool,
    pub description: String,
    pub checklist: Checklist,
    pub changed_files: Vec<FileChange>,
    pub current_labels: BTreeSet<String>,
    pub mergeable: Option<bool>,
    pub head_sha: String,
    pub state: PrState,
    pub merged: bool,
}

impl PullRequestSnapshot {
    pub fn new(details: PullRequestDetails, changed_files: Vec<FileChange>) -> Self {
        let checklist = Checklist::parse(&details.description);
        Self {
            number: details.number,
            author: details.author,
            is_draft: details.is_draft,
            is_member_or_owner: details.author_association.is_member_or_owner(),
            is_bot: details.is_bot,
            description: details.description,
            checklist,
            changed_files,
            current_labels: details.labels,
            mergeable: details.mergeable,
            head_sha: details.head_sha,
            state: details.state,
            merged: details.merged,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == PrState::Open
    }

    /// Conflicts are only known once the host has computed mergeability.
    pub fn has_conflicts(&self) -> Option<bool> {
        self.mergeable.map(|mergeable| !mergeable)
    }
}

/// An issue as delivered in an `issues` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueSnapshot {
    pub number: u64,
    pub author: String,
    pub body: String,
}

/// Aggregate state of the CI check runs on a pull request's head commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Failing,
    Pending,
}

impl CheckStatus {
    /// `None` while checks are still running.
    pub fn tests_passing(self) -> Option<bool> {
        match self {
            CheckStatus::Passing => Some(true),
            CheckStatus::Failing => Some(false),
            CheckStatus::Pending => None,
        }
    }
}

/// Latest decisive review by a maintainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    #[default]
    None,
    ChangesRequested,
    Approved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReviewSignal {
    pub state: ReviewState,
    /// The author pushed commits after the latest decisive review.
    pub commits_since_review: bool,
}

impl ReviewSignal {
    pub fn new(state: ReviewState, commits_since_review: bool) -> Self {
        Self {
            state,
            commits_since_review,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_is_lowercased_and_optional() {
        assert_eq!(
            FileChange::new("maths/Prime.PY", FileStatus::Added).extension,
            Some("py".to_string())
        );
        assert_eq!(
            FileChange::new("scripts/build", FileStatus::Added).extension,
            None
        );
        assert_eq!(FileChange::new(".gitignore", FileStatus::Added).extension, None);
        assert_eq!(FileChange::new("weird.", FileStatus::Added).extension, None);
    }

    #[test]
    fn test_root_dotfile_detection() {
        assert!(FileChange::new(".pre-commit-config", FileStatus::Modified).is_root_dotfile());
        assert!(!FileChange::new("docs/.hidden", FileStatus::Modified).is_root_dotfile());
        assert!(!FileChange::new("Makefile", FileStatus::Modified).is_root_dotfile());
    }

    #[test]
    fn test_checklist_parsing() {
        let description = "## Checklist\n- [x] I have read CONTRIBUTING.md\n- [ ] This PR only changes one algorithm\n* [X] All functions have type hints\n";
        let checklist = Checklist::parse(description);
        assert!(checklist.has_checkboxes);
        assert_eq!(checklist.checked_boxes.len(), 2);
        assert!(checklist
            .checked_boxes
            .contains("I have read CONTRIBUTING.md"));
    }

    #[test]
    fn test_checklist_absent() {
        let checklist = Checklist::parse("Adds a bubble sort.\n- a bullet\n- [link](x)");
        assert!(!checklist.has_checkboxes);
        assert!(checklist.checked_boxes.is_empty());
    }

    #[test]
    fn test_unchecked_only() {
        let checklist = Checklist::parse("- [ ] one\n  - [ ] two");
        assert!(checklist.has_checkboxes);
        assert!(checklist.checked_boxes.is_empty());
    }

    #[test]
    fn test_author_association_from_github() {
        let parsed: AuthorAssociation = serde_json::from_str("\"FIRST_TIME_CONTRIBUTOR\"").unwrap();
        assert_eq!(parsed, AuthorAssociation::FirstTimeContributor);
        let unknown: AuthorAssociation = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(unknown, AuthorAssociation::None);
        assert!(AuthorAssociation::Owner.is_member_or_owner());
        assert!(!AuthorAssociation::Collaborator.is_member_or_owner());
    }

    #[test]
    fn test_association_names() {
        assert_eq!(
            AuthorAssociation::from_name("Member"),
            Some(AuthorAssociation::Member)
        );
        assert_eq!(
            AuthorAssociation::from_name("first-time-contributor"),
            Some(AuthorAssociation::FirstTimeContributor)
        );
        assert_eq!(AuthorAssociation::from_name("maintainer"), None);
    }
}
