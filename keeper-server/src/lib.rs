pub mod api;
pub mod config;
pub mod dispatcher;
pub mod github;
pub mod interpreter;
pub mod ledger;
pub mod locks;
pub mod pipeline;
pub mod retry;
pub mod webhook;

#[cfg(test)]
mod memory;

use std::sync::Arc;

use crate::dispatcher::Dispatcher;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn get_bot_version() -> String {
    // Prefer the commit hash injected by the release build
    match option_env!("KEEPER_GIT_HASH") {
        Some(git_hash) if !git_hash.is_empty() => {
            let short = git_hash.get(..8).unwrap_or(git_hash);
            format!("{}+{}", built_info::PKG_VERSION, short)
        }
        _ => built_info::PKG_VERSION.to_string(),
    }
}

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub webhook_secret: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_starts_with_package_version() {
        assert!(get_bot_version().starts_with(env!("CARGO_PKG_VERSION")));
    }
}
