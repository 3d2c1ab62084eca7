//! Tunable policy values.
//!
//! The server fills these from the environment; everything has a default
//! matching the behaviour the bot ships with.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::snapshot::AuthorAssociation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum open pull requests per non-member author. `0` disables the limit.
    pub max_pr_by_user: usize,
    /// Path prefixes that are never evaluated or analyzed.
    pub excluded_prefixes: Vec<String>,
    /// When non-empty, every evaluated file must carry one of these extensions.
    pub accepted_extensions: Vec<String>,
    /// Extensions of files handed to the source analyzer.
    pub analyzed_extensions: Vec<String>,
    /// Extensions that mark a pull request as documentation.
    pub docs_extensions: Vec<String>,
    /// Generated index files that do not count as documentation changes.
    pub generated_files: Vec<String>,
    pub labels: ManagedLabels,
    pub min_identifier_length: usize,
    /// Identifiers that are never considered descriptive.
    pub placeholder_names: Vec<String>,
    pub test_patterns: TestPatterns,
    pub commands: CommandSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_pr_by_user: 0,
            excluded_prefixes: vec![".github/".to_string(), "scripts/".to_string()],
            accepted_extensions: Vec::new(),
            analyzed_extensions: vec!["py".to_string()],
            docs_extensions: vec!["md".to_string(), "rst".to_string()],
            generated_files: vec!["DIRECTORY.md".to_string()],
            labels: ManagedLabels::default(),
            min_identifier_length: 2,
            placeholder_names: ["foo", "bar", "baz", "qux", "temp", "tmp", "spam", "eggs", "dummy"]
                .iter()
                .map(|name| name.to_string())
                .collect(),
            test_patterns: TestPatterns::default(),
            commands: CommandSettings::default(),
        }
    }
}

impl Settings {
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
    }

    pub fn is_placeholder(&self, name: &str) -> bool {
        self.placeholder_names
            .iter()
            .any(|placeholder| placeholder.eq_ignore_ascii_case(name))
    }
}

/// Label names for every category the reconciler owns. Labels outside this
/// set are never added or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedLabels {
    pub tests_failing: String,
    pub awaiting_review: String,
    pub awaiting_changes: String,
    pub has_conflicts: String,
    pub require_tests: String,
    pub require_type_hints: String,
    pub require_descriptive_names: String,
    pub documentation: String,
    pub enhancement: String,
}

impl Default for ManagedLabels {
    fn default() -> Self {
        Self {
            tests_failing: "Status: Tests are failing".to_string(),
            awaiting_review: "Status: awaiting reviews".to_string(),
            awaiting_changes: "Status: awaiting changes".to_string(),
            has_conflicts: "Status: Merge conflicts".to_string(),
            require_tests: "Require: Tests".to_string(),
            require_type_hints: "Require: Type hints".to_string(),
            require_descriptive_names: "Require: Descriptive names".to_string(),
            documentation: "documentation".to_string(),
            enhancement: "enhancement".to_string(),
        }
    }
}

impl ManagedLabels {
    pub fn all(&self) -> BTreeSet<String> {
        [
            &self.tests_failing,
            &self.awaiting_review,
            &self.awaiting_changes,
            &self.has_conflicts,
            &self.require_tests,
            &self.require_type_hints,
            &self.require_descriptive_names,
            &self.documentation,
            &self.enhancement,
        ]
        .into_iter()
        .cloned()
        .collect()
    }

    pub fn is_managed(&self, label: &str) -> bool {
        self.all().contains(label)
    }

    /// Labels of the review-status category.
    pub fn review_status(&self) -> [&str; 2] {
        [&self.awaiting_review, &self.awaiting_changes]
    }
}

/// Name patterns that mark a Python construct as a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPatterns {
    pub function_prefixes: Vec<String>,
    pub class_prefixes: Vec<String>,
    /// Callee names (last segment) that count as assertions, matched by prefix.
    pub assertion_prefixes: Vec<String>,
    pub testing_modules: Vec<String>,
    /// Prompt that marks an interactive example inside a docstring.
    pub doctest_prompt: String,
}

impl Default for TestPatterns {
    fn default() -> Self {
        Self {
            function_prefixes: vec!["test_".to_string()],
            class_prefixes: vec!["Test".to_string()],
            assertion_prefixes: vec!["assert".to_string()],
            testing_modules: ["unittest", "pytest", "doctest", "hypothesis"]
                .iter()
                .map(|module| module.to_string())
                .collect(),
            doctest_prompt: ">>> ".to_string(),
        }
    }
}

impl TestPatterns {
    /// `test_*.py` and `*_test.py`.
    pub fn is_test_file(&self, file_name: &str) -> bool {
        let Some(stem) = file_name.strip_suffix(".py") else {
            return false;
        };
        stem.starts_with("test_") || stem.ends_with("_test")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSettings {
    /// Mention that introduces a command, e.g. `@algorithms-keeper`.
    pub mention: String,
    /// Associations allowed to issue commands.
    pub authorized: Vec<AuthorAssociation>,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            mention: "@algorithms-keeper".to_string(),
            authorized: vec![AuthorAssociation::Owner, AuthorAssociation::Member],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded_prefixes() {
        let settings = Settings::default();
        assert!(settings.is_excluded(".github/workflows/build"));
        assert!(settings.is_excluded("scripts/validate_filenames"));
        assert!(!settings.is_excluded("maths/scripts.py"));
    }

    #[test]
    fn test_empty_prefix_excludes_nothing() {
        let settings = Settings {
            excluded_prefixes: vec![String::new()],
            ..Settings::default()
        };
        assert!(!settings.is_excluded("anything"));
    }

    #[test]
    fn test_managed_labels_are_distinct() {
        let labels = ManagedLabels::default();
        assert_eq!(labels.all().len(), 9);
        assert!(labels.is_managed("Require: Tests"));
        assert!(!labels.is_managed("good first issue"));
    }

    #[test]
    fn test_test_file_names() {
        let patterns = TestPatterns::default();
        assert!(patterns.is_test_file("test_sorts.py"));
        assert!(patterns.is_test_file("bubble_sort_test.py"));
        assert!(!patterns.is_test_file("testing.py"));
        assert!(!patterns.is_test_file("test_sorts.txt"));
    }

    #[test]
    fn test_placeholder_names_ignore_case() {
        let settings = Settings::default();
        assert!(settings.is_placeholder("Foo"));
        assert!(!settings.is_placeholder("food"));
    }
}
