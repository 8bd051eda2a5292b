use std::sync::Arc;

use crate::cloud::GoogleAuth;
use crate::cloud::auth::FileSecretStore;
use crate::config::Config;
use crate::download::AudioCache;
use crate::feed::{self, FeedCache};
use crate::state::LocalStateFile;

pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl CheckResult {
    fn ok(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message: message.to_string(),
        }
    }

    fn warning(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warning,
            message: message.to_string(),
        }
    }

    fn error(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Error,
            message: message.to_string(),
        }
    }

    pub fn icon(&self) -> &'static str {
        match self.status {
            CheckStatus::Ok => "✓",
            CheckStatus::Warning => "⚠",
            CheckStatus::Error => "✗",
        }
    }

    pub fn color(&self) -> &'static str {
        match self.status {
            CheckStatus::Ok => "\x1b[32m",      // green
            CheckStatus::Warning => "\x1b[33m", // yellow
            CheckStatus::Error => "\x1b[31m",   // red
        }
    }
}

pub async fn run_checks(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(check_feed(config).await);
    results.push(check_storage(config));
    results.push(check_cloud(config).await);
    results.push(check_playback_state(config));

    results
}

async fn check_feed(config: &Config) -> CheckResult {
    let cache = match FeedCache::new(config) {
        Ok(cache) => cache,
        Err(e) => return CheckResult::error("Feed", &format!("Client setup failed: {}", e)),
    };

    let Some(document) = cache.get_feed().await else {
        return CheckResult::error(
            "Feed",
            &format!("Could not fetch {}", config.show.feed_url),
        );
    };

    match feed::parse_items(&document) {
        Ok(items) if items.is_empty() => {
            CheckResult::warning("Feed", "Reachable but lists no episodes")
        }
        Ok(items) => CheckResult::ok("Feed", &format!("{} episodes listed", items.len())),
        Err(e) => CheckResult::error("Feed", &format!("Feed is not valid RSS: {}", e)),
    }
}

fn check_storage(config: &Config) -> CheckResult {
    let audio_dir = config.storage.audio_dir();

    if let Err(e) = std::fs::create_dir_all(&audio_dir) {
        return CheckResult::error("Storage", &format!("Cannot create cache dir: {}", e));
    }

    let test_file = audio_dir.join(".rocksync_test");
    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&test_file);
            let cached = AudioCache::new(&audio_dir, &config.show.file_prefix)
                .cached_episodes()
                .len();
            CheckResult::ok(
                "Storage",
                &format!("{} ({} episodes cached)", audio_dir.display(), cached),
            )
        }
        Err(e) => CheckResult::error("Storage", &format!("Cache dir not writable: {}", e)),
    }
}

async fn check_cloud(config: &Config) -> CheckResult {
    if !config.cloud.enabled {
        return CheckResult::warning(
            "Cloud",
            "Disabled. Playback position stays on this device.",
        );
    }

    let store = Arc::new(FileSecretStore::new(config.storage.data_dir()));
    let auth = match GoogleAuth::new(&config.cloud, store) {
        Ok(auth) => auth,
        Err(e) => return CheckResult::error("Cloud", &format!("Misconfigured: {}", e)),
    };

    if auth.current_token().await.is_none() {
        return CheckResult::warning("Cloud", "Not signed in. Run `rocksync sign-in`.");
    }

    match auth.valid_token().await {
        Ok(_) => CheckResult::ok("Cloud", "Signed in"),
        Err(e) if e.is_auth_failure() => CheckResult::error(
            "Cloud",
            &format!("Sign-in expired ({}). Run `rocksync sign-in`.", e),
        ),
        Err(e) => CheckResult::error("Cloud", &format!("Token refresh failed: {}", e)),
    }
}

fn check_playback_state(config: &Config) -> CheckResult {
    let file = LocalStateFile::in_dir(&config.storage.data_dir());

    if !file.path().exists() {
        return CheckResult::ok("Playback", "No saved position yet");
    }

    match file.load() {
        Some(state) => CheckResult::ok("Playback", &state.summary()),
        None => CheckResult::warning(
            "Playback",
            &format!("{} is unreadable and will be replaced", file.path().display()),
        ),
    }
}

pub fn print_results(results: &[CheckResult]) {
    let reset = "\x1b[0m";

    println!("\nrocksync doctor\n");

    for result in results {
        println!(
            "  {}{} {}{}  {}",
            result.color(),
            result.icon(),
            result.name,
            reset,
            result.message
        );
    }

    println!();

    let errors = results
        .iter()
        .filter(|r| matches!(r.status, CheckStatus::Error))
        .count();
    let warnings = results
        .iter()
        .filter(|r| matches!(r.status, CheckStatus::Warning))
        .count();

    if errors > 0 {
        println!("  {} error(s), {} warning(s)", errors, warnings);
        println!("  Fix errors above to use rocksync.\n");
    } else if warnings > 0 {
        println!(
            "  {} warning(s) - rocksync will work with limited features.\n",
            warnings
        );
    } else {
        println!("  All checks passed!\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PlaybackState;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = Some(dir.join("data"));
        config.storage.cache_dir = Some(dir.join("cache"));
        config
    }

    #[test]
    fn test_storage_check_creates_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let result = check_storage(&config);
        assert!(matches!(result.status, CheckStatus::Ok));
        assert!(result.message.contains("0 episodes cached"));
        assert!(config.storage.audio_dir().is_dir());
    }

    #[test]
    fn test_playback_check_reports_saved_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        assert_eq!(check_playback_state(&config).message, "No saved position yet");

        LocalStateFile::in_dir(&config.storage.data_dir())
            .save(&PlaybackState::new(1001, 65.0, 0.0, false))
            .unwrap();
        assert_eq!(
            check_playback_state(&config).message,
            "Episode 1001 at 1:05"
        );
    }

    #[tokio::test]
    async fn test_cloud_check_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let result = check_cloud(&config_in(dir.path())).await;
        assert!(matches!(result.status, CheckStatus::Warning));
        assert_eq!(result.icon(), "⚠");
    }
}
