use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::{CloudMirror, MirrorError};
use crate::config::Config;
use crate::download::{AudioCache, DownloadEngine, DownloadError, NoProgress, ProgressSink};
use crate::episode::{Episode, EpisodeRecord, EpisodeUrlCache, GroupRange, MergeReport};
use crate::feed::FeedSource;
use crate::resolver::{AudioUrlExtractor, Resolution, ResolutionSource, Resolver};

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("no audio url found for episode {0}")]
    NoAudioUrl(u32),
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("cloud error: {0}")]
    Mirror(#[from] MirrorError),
    #[error("not signed in to cloud storage")]
    NotSignedIn,
    #[error("cancelled")]
    Cancelled,
}

/// A local audio file and how it got there.
#[derive(Debug, Clone)]
pub struct FetchedEpisode {
    pub path: PathBuf,
    /// `None` when the file was already cached and nothing was resolved
    pub resolution: Option<Resolution>,
}

impl FetchedEpisode {
    pub fn was_cached(&self) -> bool {
        self.resolution.is_none()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RangeSummary {
    pub succeeded: Vec<u32>,
    pub skipped: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

impl std::fmt::Display for RangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} skipped, {} failed",
            self.succeeded.len(),
            self.skipped.len(),
            self.failed.len()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupReport {
    pub group: GroupRange,
    pub episodes: usize,
    pub merge: MergeReport,
}

/// Everything a UI needs to fetch episodes: resolution, download, mirror upload.
pub struct EpisodeLibrary {
    resolver: Resolver,
    engine: DownloadEngine,
    urls: EpisodeUrlCache,
    feed: Option<Arc<FeedSource>>,
    scraper: Option<Arc<dyn AudioUrlExtractor>>,
    mirror: Option<Arc<CloudMirror>>,
    group_size: u32,
    upload_episodes: bool,
}

impl EpisodeLibrary {
    pub fn new(config: &Config, urls: EpisodeUrlCache) -> Result<Self, LibraryError> {
        let cache = AudioCache::new(config.storage.audio_dir(), &config.show.file_prefix);
        let engine = DownloadEngine::new(cache.clone())?;
        Ok(Self::with_engine(config, engine, urls))
    }

    pub fn with_engine(config: &Config, engine: DownloadEngine, urls: EpisodeUrlCache) -> Self {
        let resolver = Resolver::new(config.show.clone(), engine.cache().clone(), urls.clone());
        Self {
            resolver,
            engine,
            urls,
            feed: None,
            scraper: None,
            mirror: None,
            group_size: config.cloud.group_size,
            upload_episodes: config.cloud.upload_episodes,
        }
    }

    pub fn with_feed(mut self, feed: Arc<FeedSource>) -> Self {
        self.resolver = self.resolver.with_feed(feed.clone());
        self.feed = Some(feed);
        self
    }

    pub fn with_scraper(mut self, scraper: Arc<dyn AudioUrlExtractor>) -> Self {
        self.resolver = self.resolver.with_scraper(scraper.clone());
        self.scraper = Some(scraper);
        self
    }

    pub fn with_mirror(mut self, mirror: Arc<CloudMirror>) -> Self {
        self.resolver = self.resolver.with_mirror(mirror.clone());
        self.mirror = Some(mirror);
        self
    }

    pub fn audio_cache(&self) -> &AudioCache {
        self.engine.cache()
    }

    pub fn cached_path(&self, episode: u32) -> Option<PathBuf> {
        self.audio_cache().cached_path(episode)
    }

    pub fn mirror(&self) -> Option<&Arc<CloudMirror>> {
        self.mirror.as_ref()
    }

    pub async fn info(&self, episode: u32, cancel: &CancellationToken) -> Resolution {
        self.resolver.resolve(episode, cancel).await
    }

    /// Get the episode into the local cache, resolving its audio if needed.
    pub async fn download(
        &self,
        episode: u32,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<FetchedEpisode, LibraryError> {
        if let Some(path) = self.cached_path(episode) {
            debug!(episode, "episode already cached");
            return Ok(FetchedEpisode {
                path,
                resolution: None,
            });
        }

        let resolution = self.resolver.resolve(episode, cancel).await;
        if cancel.is_cancelled() {
            return Err(LibraryError::Cancelled);
        }

        if let Some(path) = resolution.local_file.clone() {
            progress.report(1.0);
            return Ok(FetchedEpisode {
                path,
                resolution: Some(resolution),
            });
        }

        let Some(url) = resolution.episode.audio_url.clone() else {
            return Err(LibraryError::NoAudioUrl(episode));
        };

        let path = match self.engine.download(episode, &url, progress, cancel).await {
            Ok(path) => path,
            Err(DownloadError::Cancelled) => return Err(LibraryError::Cancelled),
            Err(e) => return Err(e.into()),
        };

        if resolution.source != ResolutionSource::CloudAudio {
            self.mirror_upload(episode, &path).await;
        }

        Ok(FetchedEpisode {
            path,
            resolution: Some(resolution),
        })
    }

    async fn mirror_upload(&self, episode: u32, path: &std::path::Path) {
        if !self.upload_episodes {
            return;
        }
        let Some(mirror) = &self.mirror else { return };
        if !mirror.is_authenticated().await {
            debug!(episode, "not signed in, skipping cloud upload");
            return;
        }

        if let Err(e) = mirror
            .upload_episode_audio(episode, path, Arc::new(NoProgress))
            .await
        {
            warn!(episode, error = %e, "failed to upload episode to cloud");
        }
    }

    /// Download `start..=end` one at a time, carrying on past failures.
    pub async fn download_range(
        &self,
        start: u32,
        end: u32,
        progress: &(dyn Fn(u32, f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> RangeSummary {
        let mut summary = RangeSummary::default();
        let total = end.saturating_sub(start).saturating_add(1);
        info!(start, end, total, "starting range download");

        for episode in start..=end {
            if cancel.is_cancelled() {
                warn!(episode, "range download cancelled");
                break;
            }

            if self.cached_path(episode).is_some() {
                debug!(episode, "already cached, skipping");
                summary.skipped.push(episode);
                continue;
            }

            let sink = |fraction: f64| progress(episode, fraction);
            match self.download(episode, &sink, cancel).await {
                Ok(_) => summary.succeeded.push(episode),
                Err(e) => {
                    warn!(episode, error = %e, "range download failed for episode");
                    summary.failed.push((episode, e.to_string()));
                }
            }
        }

        info!(%summary, "range download finished");
        summary
    }

    /// Resolve metadata for `start..=end` from the feed and web pages and
    /// merge it into the cloud, one document write per group.
    pub async fn cache_metadata_range(
        &self,
        start: u32,
        end: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<GroupReport>, LibraryError> {
        let Some(mirror) = &self.mirror else {
            return Err(LibraryError::NotSignedIn);
        };
        if !mirror.is_authenticated().await {
            return Err(LibraryError::NotSignedIn);
        }

        let mut reports = Vec::new();
        for group in GroupRange::covering(start, end, self.group_size) {
            let mut records = Vec::new();
            for episode in start.max(group.start)..=end.min(group.end) {
                if cancel.is_cancelled() {
                    return Err(LibraryError::Cancelled);
                }
                let found = self.metadata_without_mirror(episode, cancel).await;
                records.push(EpisodeRecord::from(&found));
            }

            if records.is_empty() {
                continue;
            }

            let episodes = records.len();
            let merge = mirror.merge_group(group, records).await?;
            reports.push(GroupReport {
                group,
                episodes,
                merge,
            });
        }

        info!(
            groups = reports.len(),
            episodes = reports.iter().map(|r| r.episodes).sum::<usize>(),
            "metadata cached to cloud"
        );
        Ok(reports)
    }

    async fn metadata_without_mirror(&self, episode: u32, cancel: &CancellationToken) -> Episode {
        let mut found = match &self.feed {
            Some(feed) => feed.resolve_from_feed(episode).await,
            None => None,
        }
        .unwrap_or_else(|| Episode::placeholder(episode, self.resolver.show()));

        if !found.has_audio()
            && let Some(scraper) = &self.scraper
            && let Some(url) = scraper.extract(&found.page_url, cancel).await
        {
            self.urls.insert(episode, url.clone());
            found.audio_url = Some(url);
        }
        found
    }

    /// Drop the local audio files, the cached feed and the session URL cache.
    pub async fn clear_cache(&self) {
        self.audio_cache().clear().await;
        if let Some(feed) = &self.feed {
            feed.cache().clear().await;
        }
        self.urls.clear();
        info!("local cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library(dir: &std::path::Path) -> EpisodeLibrary {
        let mut config = Config::default();
        config.storage.cache_dir = Some(dir.to_path_buf());
        EpisodeLibrary::new(&config, EpisodeUrlCache::new()).unwrap()
    }

    #[test]
    fn test_range_summary_display() {
        let summary = RangeSummary {
            succeeded: vec![1, 2],
            skipped: vec![3],
            failed: vec![(4, "boom".to_string())],
        };
        assert_eq!(summary.to_string(), "2 succeeded, 1 skipped, 1 failed");
    }

    #[tokio::test]
    async fn test_download_returns_cached_file() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path());
        let path = library.audio_cache().path_for(12);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"mp3").unwrap();

        let fetched = library
            .download(12, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert!(fetched.was_cached());
        assert_eq!(fetched.path, path);
    }

    #[tokio::test]
    async fn test_unresolvable_episode_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path());
        let err = library
            .download(5, &NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::NoAudioUrl(5)));
    }

    #[tokio::test]
    async fn test_range_skips_cached_and_counts_failures() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path());
        let cached = library.audio_cache().path_for(2);
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        std::fs::write(&cached, b"mp3").unwrap();

        let summary = library
            .download_range(1, 3, &|_, _| {}, &CancellationToken::new())
            .await;
        assert_eq!(summary.skipped, vec![2]);
        assert_eq!(summary.failed.len(), 2);
        assert!(summary.succeeded.is_empty());
    }

    #[tokio::test]
    async fn test_range_ending_at_highest_episode_number() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path());
        let cached = library.audio_cache().path_for(u32::MAX);
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        std::fs::write(&cached, b"mp3").unwrap();

        let summary = library
            .download_range(u32::MAX, u32::MAX, &|_, _| {}, &CancellationToken::new())
            .await;
        assert_eq!(summary.skipped, vec![u32::MAX]);
        assert!(summary.failed.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_caching_requires_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path());
        let err = library
            .cache_metadata_range(1, 10, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::NotSignedIn));
    }

    #[tokio::test]
    async fn test_clear_cache_drops_urls_and_audio() {
        let dir = tempfile::tempdir().unwrap();
        let urls = EpisodeUrlCache::new();
        let mut config = Config::default();
        config.storage.cache_dir = Some(dir.path().to_path_buf());
        let library = EpisodeLibrary::new(&config, urls.clone()).unwrap();

        urls.insert(1, "http://cdn/1.mp3");
        let path = library.audio_cache().path_for(1);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"mp3").unwrap();

        library.clear_cache().await;
        assert!(urls.is_empty());
        assert!(library.cached_path(1).is_none());
    }
}
