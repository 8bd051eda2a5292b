use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config directory not found")]
    NoConfigDir,
    #[error("config file not found at {0}")]
    NotFound(PathBuf),
    #[error("failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub show: ShowConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

/// The single show this client follows.
#[derive(Debug, Clone, Deserialize)]
pub struct ShowConfig {
    #[serde(default = "default_show_name")]
    pub name: String,
    #[serde(default = "default_feed_url")]
    pub feed_url: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Prefix for every local and cloud file name
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_episode")]
    pub default_episode: u32,
}

impl Default for ShowConfig {
    fn default() -> Self {
        Self {
            name: default_show_name(),
            feed_url: default_feed_url(),
            base_url: default_base_url(),
            file_prefix: default_file_prefix(),
            default_episode: default_episode(),
        }
    }
}

impl ShowConfig {
    pub fn page_url(&self, episode: u32) -> String {
        format!("{}/details/{}", self.base_url.trim_end_matches('/'), episode)
    }
}

fn default_show_name() -> String {
    ".NET Rocks!".to_string()
}

fn default_feed_url() -> String {
    "http://www.pwop.com/feed.aspx?show=dotnetrocks&filetype=master".to_string()
}

fn default_base_url() -> String {
    "https://www.dotnetrocks.com".to_string()
}

fn default_file_prefix() -> String {
    "dotnetrocks".to_string()
}

fn default_episode() -> u32 {
    1001
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_feed_max_age_hours")]
    pub feed_max_age_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            cache_dir: None,
            feed_max_age_hours: default_feed_max_age_hours(),
        }
    }
}

fn default_feed_max_age_hours() -> u64 {
    24
}

impl StorageConfig {
    /// Holds the playback state, device identity and stored token.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            ProjectDirs::from("", "", "rocksync")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .unwrap_or_else(|| std::env::temp_dir().join("rocksync").join("data"))
        })
    }

    /// Holds the feed document and the audio files.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            ProjectDirs::from("", "", "rocksync")
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .unwrap_or_else(|| std::env::temp_dir().join("rocksync").join("cache"))
        })
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.cache_dir().join("podcasts")
    }

    pub fn feed_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.feed_max_age_hours as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScraperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settle_ms: default_settle_ms(),
            attempts: default_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ScraperConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_settle_ms() -> u64 {
    5000
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_timeout_secs() -> u64 {
    45
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub enabled: bool,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_root_folder")]
    pub root_folder: String,
    #[serde(default = "default_group_size")]
    pub group_size: u32,
    /// Mirror every web download into the cloud episodes folder
    #[serde(default)]
    pub upload_episodes: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            client_id: None,
            client_secret: None,
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
            root_folder: default_root_folder(),
            group_size: default_group_size(),
            upload_episodes: false,
        }
    }
}

fn default_redirect_uri() -> String {
    "http://localhost/oauth2redirect".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["https://www.googleapis.com/auth/drive.file".to_string()]
}

fn default_root_folder() -> String {
    "dotnetrocks".to_string()
}

fn default_group_size() -> u32 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_periodic_secs")]
    pub periodic_secs: u64,
    #[serde(default = "default_min_save_interval_secs")]
    pub min_save_interval_secs: u64,
    #[serde(default = "default_min_position_delta_secs")]
    pub min_position_delta_secs: f64,
    #[serde(default = "default_seek_poll_ms")]
    pub seek_poll_ms: u64,
    #[serde(default = "default_seek_settle_ms")]
    pub seek_settle_ms: u64,
    /// Shown next to the saved position on other devices
    pub device_name: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            periodic_secs: default_periodic_secs(),
            min_save_interval_secs: default_min_save_interval_secs(),
            min_position_delta_secs: default_min_position_delta_secs(),
            seek_poll_ms: default_seek_poll_ms(),
            seek_settle_ms: default_seek_settle_ms(),
            device_name: None,
        }
    }
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_periodic_secs() -> u64 {
    30
}

fn default_min_save_interval_secs() -> u64 {
    5
}

fn default_min_position_delta_secs() -> f64 {
    2.0
}

fn default_seek_poll_ms() -> u64 {
    50
}

fn default_seek_settle_ms() -> u64 {
    1000
}

impl Config {
    /// Like [`Config::load_from`], but a missing file yields the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        match Self::load_from(&path) {
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("", "", "rocksync")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, url) in [
            ("show.feed_url", &self.show.feed_url),
            ("show.base_url", &self.show.base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "{} must start with http:// or https://",
                    key
                )));
            }
        }

        if self.show.file_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "show.file_prefix cannot be empty".to_string(),
            ));
        }

        if self.cloud.group_size == 0 {
            return Err(ConfigError::ValidationError(
                "cloud.group_size must be positive".to_string(),
            ));
        }

        if self.cloud.enabled && self.cloud.client_id.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::ValidationError(
                "cloud.client_id is required when cloud sync is enabled".to_string(),
            ));
        }

        if self.scraper.attempts == 0 {
            return Err(ConfigError::ValidationError(
                "scraper.attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
