use reqwest::{Client, Response};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::feed::USER_AGENT;

const DOWNLOAD_BUFF_SZ: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("download cancelled")]
    Cancelled,
}

/// Receives transfer progress as a fraction in `0.0..=1.0`.
pub trait ProgressSink: Send + Sync {
    fn report(&self, fraction: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn report(&self, fraction: f64) {
        self(fraction)
    }
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _fraction: f64) {}
}

/// Local audio files, one per episode number. A present file is a cache hit.
#[derive(Debug, Clone)]
pub struct AudioCache {
    dir: PathBuf,
    prefix: String,
}

impl AudioCache {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(&self, episode: u32) -> String {
        format!("{}_{:04}.mp3", self.prefix, episode)
    }

    pub fn path_for(&self, episode: u32) -> PathBuf {
        self.dir.join(self.file_name(episode))
    }

    pub fn cached_path(&self, episode: u32) -> Option<PathBuf> {
        let path = self.path_for(episode);
        path.is_file().then_some(path)
    }

    /// Episode numbers with a cached file, ascending.
    pub fn cached_episodes(&self) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let head = format!("{}_", self.prefix);
        let mut episodes: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                name.strip_prefix(&head)?.strip_suffix(".mp3")?.parse().ok()
            })
            .collect();
        episodes.sort_unstable();
        episodes
    }

    /// Delete the whole cache directory. Errors are logged only.
    pub async fn clear(&self) {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => info!(dir = %self.dir.display(), "audio cache cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, dir = %self.dir.display(), "failed to clear audio cache"),
        }
    }
}

pub struct DownloadEngine {
    client: Client,
    cache: AudioCache,
}

impl DownloadEngine {
    pub fn new(cache: AudioCache) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, cache })
    }

    pub fn cache(&self) -> &AudioCache {
        &self.cache
    }

    /// Fetch `url` into the episode's cache file. Returns the existing file
    /// untouched when it is already cached.
    pub async fn download(
        &self,
        episode: u32,
        url: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        if let Some(path) = self.cache.cached_path(episode) {
            debug!(episode, "already cached");
            return Ok(path);
        }

        let dest = self.cache.path_for(episode);
        tokio::fs::create_dir_all(self.cache.dir()).await?;

        info!(episode, url = %url, "downloading episode");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::InvalidResponse(format!(
                "status: {}",
                response.status()
            )));
        }

        let bytes = stream_to_file(response, &dest, progress, cancel).await?;
        info!(episode, bytes, path = %dest.display(), "download complete");
        Ok(dest)
    }
}

/// `<dest>.part`, renamed onto `dest` once the body is complete.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Stream a response body to `dest` through a temp file. Progress is only
/// reported when the server sent a content length.
pub async fn stream_to_file(
    mut response: Response,
    dest: &Path,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<u64, DownloadError> {
    let total = response.content_length().filter(|&len| len > 0);
    let part = part_path(dest);

    let result: Result<u64, DownloadError> = async {
        let file = File::create(&part).await?;
        let mut writer = BufWriter::with_capacity(DOWNLOAD_BUFF_SZ, file);
        let mut written: u64 = 0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = response.chunk() => chunk?,
            };

            let Some(bytes) = chunk else { break };
            writer.write_all(&bytes).await?;
            written += bytes.len() as u64;

            if let Some(total) = total {
                progress.report((written as f64 / total as f64).min(1.0));
            }
        }

        writer.flush().await?;
        Ok(written)
    }
    .await;

    match result {
        Ok(written) => {
            tokio::fs::rename(&part, dest).await?;
            if total.is_some() {
                progress.report(1.0);
            }
            Ok(written)
        }
        Err(e) => {
            if let Err(remove) = tokio::fs::remove_file(&part).await {
                debug!(error = %remove, "no partial file to remove");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_is_zero_padded() {
        let cache = AudioCache::new("/tmp/x", "dotnetrocks");
        assert_eq!(cache.file_name(7), "dotnetrocks_0007.mp3");
        assert_eq!(cache.file_name(1001), "dotnetrocks_1001.mp3");
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/a/dotnetrocks_0001.mp3")),
            PathBuf::from("/a/dotnetrocks_0001.mp3.part")
        );
    }

    #[test]
    fn test_cached_episodes_ignores_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path(), "dotnetrocks");
        std::fs::write(cache.path_for(12), b"x").unwrap();
        std::fs::write(cache.path_for(3), b"x").unwrap();
        std::fs::write(part_path(&cache.path_for(4)), b"x").unwrap();

        assert_eq!(cache.cached_episodes(), vec![3, 12]);
        assert!(cache.cached_path(4).is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path().join("podcasts"), "dotnetrocks");
        std::fs::create_dir_all(cache.dir()).unwrap();
        std::fs::write(cache.path_for(1), b"x").unwrap();

        cache.clear().await;
        assert!(!cache.dir().exists());
        // clearing twice is fine
        cache.clear().await;
    }
}
