//! Pull-request-wide view of the per-file analysis results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::analyzer::{AnalysisResult, Violation};
use crate::settings::Settings;
use crate::snapshot::{FileChange, FileStatus};

/// Which requirement labels the analysis asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Requirements {
    pub tests: bool,
    pub type_hints: bool,
    pub descriptive_names: bool,
}

/// An inline comment anchored to a line of a file in the diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub path: String,
    pub line: usize,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PullRequestReport {
    pub results: Vec<AnalysisResult>,
    /// The pull request adds or edits a dedicated test file.
    pub contains_test_file: bool,
}

impl PullRequestReport {
    pub fn new(results: Vec<AnalysisResult>, files: &[FileChange], settings: &Settings) -> Self {
        let contains_test_file = files.iter().any(|file| {
            file.status != FileStatus::Removed
                && settings.test_patterns.is_test_file(file.file_name())
        });
        Self {
            results,
            contains_test_file,
        }
    }

    pub fn requirements(&self) -> Requirements {
        Requirements {
            tests: !self.contains_test_file && self.results.iter().any(|result| !result.has_test),
            type_hints: self.results.iter().any(|result| !result.fully_typed),
            descriptive_names: self
                .results
                .iter()
                .any(|result| !result.has_descriptive_names),
        }
    }

    /// Violations to show for `result`. Doctest requests are dropped when the
    /// pull request carries a test file of its own.
    fn shown<'r>(&self, result: &'r AnalysisResult) -> impl Iterator<Item = &'r Violation> {
        let requests: &'r [Violation] = if self.contains_test_file {
            &[]
        } else {
            &result.doctest_requests
        };
        result.violations.iter().chain(requests)
    }

    pub fn has_violations(&self) -> bool {
        self.results
            .iter()
            .any(|result| self.shown(result).next().is_some())
    }

    /// One comment per file and line; messages on the same line are joined.
    pub fn review_comments(&self) -> Vec<ReviewComment> {
        let mut grouped: BTreeMap<(&str, usize), Vec<&str>> = BTreeMap::new();
        for result in &self.results {
            for violation in self.shown(result) {
                grouped
                    .entry((result.path.as_str(), violation.line))
                    .or_default()
                    .push(violation.message.as_str());
            }
        }
        grouped
            .into_iter()
            .map(|((path, line), messages)| ReviewComment {
                path: path.to_string(),
                line,
                body: messages.join("\n\n"),
            })
            .collect()
    }

    /// Markdown listing of every violation as `**path:line:** message`.
    pub fn summary(&self) -> String {
        summarize(&self.review_comments())
    }
}

/// Render review comments as a flat Markdown list, for when they cannot be
/// attached to the diff.
pub fn summarize(comments: &[ReviewComment]) -> String {
    comments
        .iter()
        .map(|comment| {
            let body = comment.body.replace("\n\n", " ");
            format!("* **{}:{}:** {}", comment.path, comment.line, body)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
