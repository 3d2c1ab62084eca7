//! Pure building blocks of the keeper bot.
//!
//! Nothing in this crate performs I/O. The server fetches repository state,
//! hands it to these functions, and executes the [`effect::Effect`]s they
//! describe.

pub mod analyzer;
pub mod command;
pub mod comments;
pub mod effect;
pub mod event;
pub mod policy;
pub mod quota;
pub mod reconcile;
pub mod report;
pub mod settings;
pub mod snapshot;

pub use analyzer::{analyze, AnalysisError, AnalysisResult, Violation};
pub use effect::Effect;
pub use event::{route, EventEnvelope, EventKind, Payload, RepoRef, Route};
pub use policy::{evaluate, evaluate_issue, InvalidReason, Verdict};
pub use quota::{check_quota, QuotaVerdict};
pub use reconcile::{reconcile, LabelPlan, Signals};
pub use settings::{ManagedLabels, Settings};
pub use snapshot::{FileChange, FileStatus, PullRequestSnapshot};
