//! Label state reconciliation.
//!
//! The desired label set is a pure function of the current labels and the
//! signals gathered in one pass. Only the difference is applied, so running
//! the same pass twice issues nothing the second time, and passes that end
//! with the same signals end with the same labels regardless of order.

use std::collections::BTreeSet;

use crate::policy::PrKind;
use crate::report::Requirements;
use crate::settings::ManagedLabels;
use crate::snapshot::{ReviewSignal, ReviewState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Carries the explanatory comment to post before closing.
    Invalid { comment: String },
}

/// Everything a pass learned about a pull request. `None` means the signal
/// is unknown in this pass and its category is left as it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signals {
    pub validity: Validity,
    pub tests_passing: Option<bool>,
    pub review: ReviewSignal,
    pub has_conflicts: Option<bool>,
    pub requirements: Option<Requirements>,
    pub kind: Option<PrKind>,
}

impl Signals {
    pub fn valid(review: ReviewSignal) -> Self {
        Self {
            validity: Validity::Valid,
            tests_passing: None,
            review,
            has_conflicts: None,
            requirements: None,
            kind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelPlan {
    pub add: BTreeSet<String>,
    pub remove: BTreeSet<String>,
    pub comment: Option<String>,
    pub close: bool,
}

impl LabelPlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.comment.is_none() && !self.close
    }

    /// The label set after applying the plan to `current`.
    pub fn apply(&self, current: &BTreeSet<String>) -> BTreeSet<String> {
        current
            .iter()
            .filter(|label| !self.remove.contains(*label))
            .chain(self.add.iter())
            .cloned()
            .collect()
    }
}

pub fn reconcile(current: &BTreeSet<String>, signals: &Signals, labels: &ManagedLabels) -> LabelPlan {
    let managed = labels.all();
    let present: BTreeSet<String> = current.intersection(&managed).cloned().collect();

    if let Validity::Invalid { comment } = &signals.validity {
        return LabelPlan {
            add: BTreeSet::new(),
            remove: present,
            comment: Some(comment.clone()),
            close: true,
        };
    }

    let mut desired = BTreeSet::new();
    let mut want = |label: &String, on: bool| {
        if on {
            desired.insert(label.clone());
        }
    };

    let keep = |label: &String| current.contains(label);

    let failing = signals
        .tests_passing
        .map_or_else(|| keep(&labels.tests_failing), |passing| !passing);
    want(&labels.tests_failing, failing);

    if let Some(label) = review_label(signals.review, labels) {
        want(label, true);
    }

    let conflicts = signals
        .has_conflicts
        .unwrap_or_else(|| keep(&labels.has_conflicts));
    want(&labels.has_conflicts, conflicts);

    let (tests, type_hints, names) = match signals.requirements {
        Some(required) => (
            required.tests,
            required.type_hints,
            required.descriptive_names,
        ),
        None => (
            keep(&labels.require_tests),
            keep(&labels.require_type_hints),
            keep(&labels.require_descriptive_names),
        ),
    };
    want(&labels.require_tests, tests);
    want(&labels.require_type_hints, type_hints);
    want(&labels.require_descriptive_names, names);

    // Kind labels are only ever added; maintainers may set either by hand.
    let documentation = signals.kind == Some(PrKind::Documentation);
    let enhancement = signals.kind == Some(PrKind::Enhancement);
    want(&labels.documentation, documentation || keep(&labels.documentation));
    want(&labels.enhancement, enhancement || keep(&labels.enhancement));

    LabelPlan {
        add: desired.difference(current).cloned().collect(),
        remove: present.difference(&desired).cloned().collect(),
        comment: None,
        close: false,
    }
}

/// At most one review-status label, derived from the latest decisive review.
fn review_label(review: ReviewSignal, labels: &ManagedLabels) -> Option<&String> {
    match review.state {
        ReviewState::Approved => None,
        ReviewState::ChangesRequested if !review.commits_since_review => {
            Some(&labels.awaiting_changes)
        }
        ReviewState::ChangesRequested | ReviewState::None => Some(&labels.awaiting_review),
    }
}

/// Labels to drop once a pull request is closed. Merged pull requests no
/// longer await anything.
pub fn closed_plan(current: &BTreeSet<String>, merged: bool, labels: &ManagedLabels) -> LabelPlan {
    if !merged {
        return LabelPlan::default();
    }
    LabelPlan {
        remove: labels
            .review_status()
            .into_iter()
            .filter(|label| current.contains(*label))
            .map(str::to_string)
            .collect(),
        ..LabelPlan::default()
    }
}
