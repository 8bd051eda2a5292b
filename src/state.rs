use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Where the listener is, as saved locally and to the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub episode_number: u32,
    /// Seconds from the start of the episode
    pub position: f64,
    /// Seconds, zero while unknown
    pub duration: f64,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub last_updated: DateTime<Utc>,
    pub is_playing: bool,
    #[serde(default)]
    pub episode_title: Option<String>,
    /// Informational only, never used to pick a winner
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
}

impl PlaybackState {
    pub fn new(episode_number: u32, position: f64, duration: f64, is_playing: bool) -> Self {
        Self {
            episode_number,
            position,
            duration,
            last_updated: Utc::now(),
            is_playing,
            episode_title: None,
            device_id: None,
            device_name: None,
        }
    }

    pub fn progress_percent(&self) -> Option<f64> {
        (self.duration > 0.0).then(|| (self.position / self.duration * 100.0).clamp(0.0, 100.0))
    }

    /// e.g. `Episode 1001 at 12:34 / 1:02:03`
    pub fn summary(&self) -> String {
        let mut line = format!(
            "Episode {} at {}",
            self.episode_number,
            format_time(self.position)
        );
        if self.duration > 0.0 {
            line.push_str(&format!(" / {}", format_time(self.duration)));
        }
        if let Some(name) = &self.device_name {
            line.push_str(&format!(" (from {})", name));
        }
        line
    }
}

/// Accepts RFC 3339 as well as zone-less timestamps, read as UTC.
fn lenient_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    if let Ok(t) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S"))
        .map(|t| t.and_utc())
        .map_err(serde::de::Error::custom)
}

/// `H:MM:SS` from an hour up, `M:SS` below.
pub fn format_time(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

/// The always-written local copy of the playback state.
#[derive(Debug, Clone)]
pub struct LocalStateFile {
    path: PathBuf,
}

impl LocalStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("playback_state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state from disk
    pub fn load(&self) -> Option<PlaybackState> {
        if !self.path.exists() {
            return None;
        }

        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(state) => {
                    debug!("loaded local playback state");
                    Some(state)
                }
                Err(e) => {
                    error!("failed to parse playback state: {}", e);
                    None
                }
            },
            Err(e) => {
                error!("failed to read playback state: {}", e);
                None
            }
        }
    }

    /// Save state to disk, replacing the previous file in one rename
    pub fn save(&self, state: &PlaybackState) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(state).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)
    }
}

/// Stable per-installation identity stamped on saved state.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
}

impl DeviceIdentity {
    /// Read the id stored in `data_dir`, creating it on first run.
    pub fn load_or_create(data_dir: &Path, configured_name: Option<&str>) -> Self {
        let path = data_dir.join("device_id");
        let id = match std::fs::read_to_string(&path) {
            Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                let id = generate_device_id();
                if let Err(e) = std::fs::create_dir_all(data_dir)
                    .and_then(|_| std::fs::write(&path, &id))
                {
                    warn!(error = %e, "failed to persist device id");
                }
                id
            }
        };

        let name = configured_name
            .map(String::from)
            .or_else(host_name)
            .unwrap_or_else(|| "unknown device".to_string());

        Self { id, name }
    }
}

fn generate_device_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seed = format!(
        "{}:{}:{}",
        host_name().unwrap_or_default(),
        nanos,
        std::process::id()
    );
    let digest = sha1_smol::Sha1::from(seed).digest().to_string();
    digest[..16].to_string()
}

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "0:00");
        assert_eq!(format_time(65.4), "1:05");
        assert_eq!(format_time(3599.0), "59:59");
        assert_eq!(format_time(3723.0), "1:02:03");
        assert_eq!(format_time(-3.0), "0:00");
        assert_eq!(format_time(f64::NAN), "0:00");
    }

    #[test]
    fn test_state_json_field_names() {
        let mut state = PlaybackState::new(1001, 125.5, 3600.0, true);
        state.device_id = Some("abc".to_string());

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["episodeNumber"], 1001);
        assert_eq!(json["position"], 125.5);
        assert_eq!(json["isPlaying"], true);
        assert_eq!(json["deviceId"], "abc");
        assert!(json["lastUpdated"].is_string());
    }

    #[test]
    fn test_state_accepts_zoneless_timestamp() {
        let state: PlaybackState = serde_json::from_str(
            r#"{"episodeNumber": 5, "position": 1.0, "duration": 2.0,
                "lastUpdated": "2024-03-01T10:20:30.1234567", "isPlaying": false}"#,
        )
        .unwrap();
        assert_eq!(state.last_updated.to_rfc3339().get(..19), Some("2024-03-01T10:20:30"));
        assert_eq!(state.device_name, None);
    }

    #[test]
    fn test_local_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = LocalStateFile::in_dir(&dir.path().join("nested"));
        assert!(file.load().is_none());

        let state = PlaybackState::new(42, 10.0, 100.0, false);
        file.save(&state).unwrap();
        assert_eq!(file.load(), Some(state));
    }

    #[test]
    fn test_corrupt_local_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = LocalStateFile::in_dir(dir.path());
        std::fs::write(file.path(), "{ not json").unwrap();
        assert!(file.load().is_none());
    }

    #[test]
    fn test_device_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = DeviceIdentity::load_or_create(dir.path(), Some("laptop"));
        let second = DeviceIdentity::load_or_create(dir.path(), None);
        assert_eq!(first.id, second.id);
        assert_eq!(first.id.len(), 16);
        assert_eq!(first.name, "laptop");
    }

    #[test]
    fn test_summary() {
        let mut state = PlaybackState::new(1001, 754.0, 3723.0, false);
        state.device_name = Some("phone".to_string());
        assert_eq!(state.summary(), "Episode 1001 at 12:34 / 1:02:03 (from phone)");
        assert_eq!(state.progress_percent().map(|p| p.round()), Some(20.0));
    }
}
