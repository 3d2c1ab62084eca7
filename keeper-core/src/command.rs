/// Command parsing for bot mentions in issue and pull request comments
use std::fmt;

use crate::analyzer::AnalysisScope;
use crate::settings::CommandSettings;
use crate::snapshot::AuthorAssociation;

/// A parsed keeper command from a comment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperCommand {
    /// Re-run the checks on the files the pull request adds, with inline comments
    Review,
    /// Re-run the checks on every changed file, updating labels only
    ReviewAll,
}

impl KeeperCommand {
    pub fn scope(self) -> AnalysisScope {
        match self {
            KeeperCommand::Review => AnalysisScope::AddedOnly,
            KeeperCommand::ReviewAll => AnalysisScope::All,
        }
    }

    /// Whether the command may post inline review comments.
    pub fn posts_review(self) -> bool {
        matches!(self, KeeperCommand::Review)
    }
}

impl fmt::Display for KeeperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeeperCommand::Review => write!(f, "review"),
            KeeperCommand::ReviewAll => write!(f, "review-all"),
        }
    }
}

/// Result of parsing a comment for keeper commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// No mention of the bot in the comment
    NoMention,
    /// Bot was mentioned but the command was not recognized
    UnrecognizedCommand {
        /// The unrecognized command text that was attempted
        attempted: String,
    },
    /// A valid command was found
    Command(KeeperCommand),
}

/// A command that has been verified to come from an authorized user.
///
/// Only [`try_authorize`] constructs this, so any code that acts on a command
/// must have gone through the role check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorizedCommand(KeeperCommand);

impl AuthorizedCommand {
    pub fn command(self) -> KeeperCommand {
        self.0
    }
}

/// Outcome of checking a comment for an actionable command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// No mention, or a mention from someone who may not issue commands.
    Ignored,
    Unrecognized { attempted: String },
    Authorized(AuthorizedCommand),
}

/// Parse `body` and check the commenter's association against the
/// authorized roles.
///
/// Comments from unauthorized users are ignored outright, including
/// unrecognized commands, so the bot never answers them.
pub fn try_authorize(
    body: &str,
    association: AuthorAssociation,
    settings: &CommandSettings,
) -> Authorization {
    if !settings.authorized.contains(&association) {
        return Authorization::Ignored;
    }
    match parse_comment(body, &settings.mention) {
        ParseResult::NoMention => Authorization::Ignored,
        ParseResult::UnrecognizedCommand { attempted } => Authorization::Unrecognized { attempted },
        ParseResult::Command(command) => Authorization::Authorized(AuthorizedCommand(command)),
    }
}

/// Parse a comment body for keeper commands
///
/// Commands must be on a single line, in the form `<mention> <command>`. The
/// mention must start the line (after trimming) and is matched
/// case-insensitively; it must be followed by whitespace.
///
/// # First Mention Wins
///
/// The parser stops at the first line that starts with the mention, even if
/// that mention carries no command or an unrecognized one. Later lines are
/// not scanned.
///
/// # Available Commands
///
/// - `review` - check the files added by the pull request
/// - `review-all` - check every changed file
pub fn parse_comment(body: &str, mention: &str) -> ParseResult {
    if mention.is_empty() {
        return ParseResult::NoMention;
    }

    for line in body.lines() {
        let trimmed = line.trim();

        // `get` avoids slicing through a multi-byte character
        let Some(prefix) = trimmed.get(..mention.len()) else {
            continue;
        };
        if !prefix.eq_ignore_ascii_case(mention) {
            continue;
        }

        let rest = &trimmed[mention.len()..];

        if rest.is_empty() {
            return ParseResult::UnrecognizedCommand {
                attempted: String::new(),
            };
        }

        // "@algorithms-keeperreview" or "@algorithms-keeper-bot" is someone else
        if !rest.starts_with(|c: char| c.is_whitespace()) {
            continue;
        }

        let command_word = rest.split_whitespace().next().unwrap_or_default();

        return if command_word.eq_ignore_ascii_case("review") {
            ParseResult::Command(KeeperCommand::Review)
        } else if command_word.eq_ignore_ascii_case("review-all") {
            ParseResult::Command(KeeperCommand::ReviewAll)
        } else {
            ParseResult::UnrecognizedCommand {
                attempted: command_word.to_string(),
            }
        };
    }

    ParseResult::NoMention
}
