use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use keeper_core::Settings;

use crate::pipeline::PipelineOptions;
use crate::retry::RetryPolicy;

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    pub github_webhook_secret: String,
    pub port: u16,
    /// Open pull requests allowed per author; `0` disables the quota.
    pub max_pr_by_user: usize,
    pub mention: String,
    pub excluded_paths: Vec<String>,
    pub min_name_length: usize,
    pub accepted_extensions: Vec<String>,
    pub file_timeout: Duration,
    pub rate_limit_per_hour: u32,
    pub delivery_ttl: Duration,
    pub retry_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let github_app_id = lookup("GITHUB_APP_ID")
            .context("GITHUB_APP_ID environment variable is required")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = match lookup("GITHUB_PRIVATE_KEY") {
            Some(key) => key.replace("\\n", "\n"),
            None => {
                let path = lookup("GITHUB_PRIVATE_KEY_PATH").context(
                    "GITHUB_PRIVATE_KEY or GITHUB_PRIVATE_KEY_PATH environment variable is required",
                )?;
                fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read private key from {}", path))?
            }
        };

        let github_webhook_secret = lookup("GITHUB_WEBHOOK_SECRET")
            .context("GITHUB_WEBHOOK_SECRET environment variable is required")?;

        let defaults = Settings::default();

        let port = parse_or(&lookup, "PORT", 3000u16)?;
        let max_pr_by_user = parse_or(&lookup, "MAX_PR_BY_USER", defaults.max_pr_by_user)?;
        let mention = lookup("KEEPER_MENTION")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| defaults.commands.mention.clone());
        let excluded_paths = lookup("KEEPER_EXCLUDED_PATHS")
            .map(|value| parse_list(&value))
            .unwrap_or_else(|| defaults.excluded_prefixes.clone());
        let min_name_length =
            parse_or(&lookup, "KEEPER_MIN_NAME_LENGTH", defaults.min_identifier_length)?;
        let accepted_extensions = lookup("KEEPER_ACCEPTED_EXTENSIONS")
            .map(|value| {
                parse_list(&value)
                    .into_iter()
                    .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default();
        let file_timeout = Duration::from_secs(parse_or(&lookup, "KEEPER_FILE_TIMEOUT_SECS", 20u64)?);
        let rate_limit_per_hour = parse_or(&lookup, "KEEPER_RATE_LIMIT_PER_HOUR", 4500u32)?;
        let delivery_ttl = Duration::from_secs(parse_or(&lookup, "KEEPER_DELIVERY_TTL_SECS", 1800u64)?);
        let retry_attempts = parse_or(&lookup, "KEEPER_RETRY_ATTEMPTS", 4u32)?;

        Ok(Config {
            github_app_id,
            github_private_key,
            github_webhook_secret,
            port,
            max_pr_by_user,
            mention,
            excluded_paths,
            min_name_length,
            accepted_extensions,
            file_timeout,
            rate_limit_per_hour,
            delivery_ttl,
            retry_attempts,
        })
    }

    /// Policy settings with the configured overrides applied.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        settings.max_pr_by_user = self.max_pr_by_user;
        settings.excluded_prefixes = self.excluded_paths.clone();
        settings.min_identifier_length = self.min_name_length;
        settings.accepted_extensions = self.accepted_extensions.clone();
        settings.commands.mention = self.mention.clone();
        settings
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            file_timeout: self.file_timeout,
            ..PipelineOptions::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            ..RetryPolicy::default()
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name).filter(|s| !s.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number", name)),
        None => Ok(default),
    }
}

/// Split a comma separated list, dropping empty entries.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("GITHUB_APP_ID", "1234"),
        ("GITHUB_PRIVATE_KEY", "-----BEGIN KEY-----\\nabc\\n-----END KEY-----"),
        ("GITHUB_WEBHOOK_SECRET", "secret"),
    ];

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.github_app_id, 1234);
        assert_eq!(config.github_private_key, "-----BEGIN KEY-----\nabc\n-----END KEY-----");
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_pr_by_user, 0);
        assert_eq!(config.mention, "@algorithms-keeper");
        assert_eq!(config.excluded_paths, vec![".github/", "scripts/"]);
        assert_eq!(config.file_timeout, Duration::from_secs(20));
        assert_eq!(config.rate_limit_per_hour, 4500);
        assert_eq!(config.delivery_ttl, Duration::from_secs(1800));
        assert_eq!(config.settings(), Settings::default());
    }

    #[test]
    fn test_overrides_flow_into_settings() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("MAX_PR_BY_USER", "2"),
            ("KEEPER_MENTION", "@keeper"),
            ("KEEPER_EXCLUDED_PATHS", "docs/, ,vendor/"),
            ("KEEPER_ACCEPTED_EXTENSIONS", ".py, MD"),
            ("KEEPER_FILE_TIMEOUT_SECS", "5"),
            ("KEEPER_RETRY_ATTEMPTS", "0"),
        ]);
        let config = Config::from_lookup(lookup(&vars)).unwrap();
        let settings = config.settings();
        assert_eq!(settings.max_pr_by_user, 2);
        assert_eq!(settings.commands.mention, "@keeper");
        assert_eq!(settings.excluded_prefixes, vec!["docs/", "vendor/"]);
        assert_eq!(settings.accepted_extensions, vec!["py", "md"]);
        assert_eq!(config.pipeline_options().file_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_policy().max_attempts, 1);
    }

    #[test]
    fn test_missing_required_variable() {
        let error = Config::from_lookup(lookup(&REQUIRED[..2])).err().unwrap();
        assert!(error.to_string().contains("GITHUB_WEBHOOK_SECRET"));
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PORT", "eighty"));
        let error = Config::from_lookup(lookup(&vars)).err().unwrap();
        assert!(error.to_string().contains("PORT"));
    }

    #[test]
    fn test_private_key_path() {
        let path = std::env::temp_dir().join(format!("keeper-key-{}.pem", std::process::id()));
        fs::write(&path, "pem contents").unwrap();
        let path_str = path.to_string_lossy().to_string();
        let vars = [
            ("GITHUB_APP_ID", "1"),
            ("GITHUB_PRIVATE_KEY_PATH", path_str.as_str()),
            ("GITHUB_WEBHOOK_SECRET", "secret"),
        ];
        let config = Config::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.github_private_key, "pem contents");
        fs::remove_file(path).unwrap();
    }
}
