use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;

use keeper_core::analyzer::{is_analyzable, AnalysisScope};
use keeper_core::report::{PullRequestReport, Requirements, ReviewComment};
use keeper_core::snapshot::{AuthorAssociation, PrState, PullRequestDetails};
use keeper_core::{analyze, evaluate, AnalysisResult, FileChange, FileStatus, PullRequestSnapshot, Settings, Verdict};

/// Keeper: contribution checks for algorithm submissions
#[derive(Parser, Debug)]
#[command(name = "keeper")]
#[command(about = "Run keeper's checks on local files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze Python sources for tests, type hints and descriptive names
    Analyze(AnalyzeArgs),
    /// Check a pull request description and file list against the policy
    Policy(PolicyArgs),
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// Files to analyze
    #[arg(required = true)]
    files: Vec<String>,

    /// Print the results as JSON
    #[arg(long)]
    json: bool,

    /// Minimum length of a descriptive identifier
    #[arg(long)]
    min_name_length: Option<usize>,

    /// Exit with an error when any requirement is unmet
    #[arg(long)]
    check: bool,
}

#[derive(Parser, Debug)]
struct PolicyArgs {
    /// File containing the pull request description
    #[arg(long)]
    description: String,

    /// Paths the pull request adds
    #[arg(num_args = 0..)]
    files: Vec<String>,

    /// Accepted file extensions (comma separated); empty accepts everything
    #[arg(long, value_delimiter = ',')]
    accepted_extensions: Vec<String>,
}

#[derive(Serialize)]
struct AnalyzeOutput<'a> {
    results: &'a [AnalysisResult],
    skipped: &'a [String],
    requirements: Requirements,
    comments: Vec<ReviewComment>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Analyze(args) => run_analyze(args),
        Commands::Policy(args) => run_policy(args),
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<()> {
    let mut settings = Settings::default();
    if let Some(length) = args.min_name_length {
        settings.min_identifier_length = length;
    }

    let files: Vec<FileChange> = args
        .files
        .iter()
        .map(|path| FileChange::new(path.as_str(), FileStatus::Added))
        .collect();

    let mut results = Vec::new();
    let mut skipped = Vec::new();
    for file in &files {
        if !is_analyzable(file, AnalysisScope::All, &settings) {
            skipped.push(file.path.clone());
            continue;
        }
        let source = fs::read_to_string(&file.path)
            .with_context(|| format!("Failed to read {}", file.path))?;
        let result = analyze(&file.path, &source, &settings)
            .unwrap_or_else(|e| e.into_result(&file.path));
        results.push(result);
    }

    let report = PullRequestReport::new(results, &files, &settings);
    let requirements = report.requirements();

    if args.json {
        let output = AnalyzeOutput {
            results: &report.results,
            skipped: &skipped,
            requirements,
            comments: report.review_comments(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for path in &skipped {
            eprintln!("Skipped {}", path);
        }
        if report.has_violations() {
            println!("{}", report.summary());
        } else {
            println!("No issues found in {} file(s).", report.results.len());
        }
        print_requirements(requirements, &settings);
    }

    if args.check && (requirements.tests || requirements.type_hints || requirements.descriptive_names) {
        bail!("requirements not met");
    }
    Ok(())
}

fn print_requirements(requirements: Requirements, settings: &Settings) {
    let labels = &settings.labels;
    for (needed, label) in [
        (requirements.tests, &labels.require_tests),
        (requirements.type_hints, &labels.require_type_hints),
        (requirements.descriptive_names, &labels.require_descriptive_names),
    ] {
        if needed {
            println!("{}", label);
        }
    }
}

fn run_policy(args: PolicyArgs) -> Result<()> {
    let description = fs::read_to_string(&args.description)
        .with_context(|| format!("Failed to read {}", args.description))?;
    let settings = Settings {
        accepted_extensions: args.accepted_extensions,
        ..Settings::default()
    };

    let details = PullRequestDetails {
        number: 0,
        author: "local".to_string(),
        author_association: AuthorAssociation::Contributor,
        is_bot: false,
        is_draft: false,
        description,
        labels: Default::default(),
        mergeable: Some(true),
        head_sha: String::new(),
        state: PrState::Open,
        merged: false,
    };
    let files = args
        .files
        .iter()
        .map(|path| FileChange::new(path.as_str(), FileStatus::Added))
        .collect();
    let snapshot = PullRequestSnapshot::new(details, files);

    match evaluate(&snapshot, &settings) {
        Verdict::Valid | Verdict::Neutral => {
            println!("Pull request passes the policy.");
            Ok(())
        }
        Verdict::Invalid { reason, .. } => bail!("pull request would be closed: {}", reason),
    }
}
