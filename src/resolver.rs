use futures::future::BoxFuture;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ShowConfig;
use crate::download::AudioCache;
use crate::episode::{Episode, EpisodeUrlCache};

/// Anything that can describe an episode by number, e.g. the feed.
pub trait EpisodeSource: Send + Sync {
    fn lookup(&self, episode: u32) -> BoxFuture<'_, Option<Episode>>;
}

/// Last-resort audio URL lookup from the episode's web page.
pub trait AudioUrlExtractor: Send + Sync {
    fn extract<'a>(
        &'a self,
        page_url: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Option<String>>;
}

/// The cloud copy of episode audio and metadata, as the resolver sees it.
/// Every method degrades to "nothing there" on failure.
pub trait EpisodeMirror: Send + Sync {
    fn is_authenticated(&self) -> BoxFuture<'_, bool>;

    /// Copy the mirrored audio file to `dest`; `false` when there is none.
    fn fetch_audio<'a>(
        &'a self,
        episode: u32,
        dest: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, bool>;

    fn lookup_metadata(&self, episode: u32) -> BoxFuture<'_, Option<Episode>>;

    /// Merge one episode's metadata into its group document.
    fn store_metadata<'a>(&'a self, episode: &'a Episode) -> BoxFuture<'a, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    CloudAudio,
    CloudMetadata,
    Feed,
    UrlCache,
    PageScrape,
    /// Every source was tried and none had audio
    Unresolved,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CloudAudio => "cloud audio",
            Self::CloudMetadata => "cloud metadata",
            Self::Feed => "feed",
            Self::UrlCache => "url cache",
            Self::PageScrape => "page scrape",
            Self::Unresolved => "unresolved",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub episode: Episode,
    pub source: ResolutionSource,
    /// Set when the audio already landed in the local cache
    pub local_file: Option<PathBuf>,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        self.local_file.is_some() || self.episode.has_audio()
    }
}

/// Walks the sources in a fixed order and stops at the first one that yields audio.
pub struct Resolver {
    show: ShowConfig,
    audio: AudioCache,
    urls: EpisodeUrlCache,
    feed: Option<Arc<dyn EpisodeSource>>,
    scraper: Option<Arc<dyn AudioUrlExtractor>>,
    mirror: Option<Arc<dyn EpisodeMirror>>,
}

impl Resolver {
    pub fn new(show: ShowConfig, audio: AudioCache, urls: EpisodeUrlCache) -> Self {
        Self {
            show,
            audio,
            urls,
            feed: None,
            scraper: None,
            mirror: None,
        }
    }

    pub fn with_feed(mut self, feed: Arc<dyn EpisodeSource>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_scraper(mut self, scraper: Arc<dyn AudioUrlExtractor>) -> Self {
        self.scraper = Some(scraper);
        self
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn EpisodeMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn urls(&self) -> &EpisodeUrlCache {
        &self.urls
    }

    pub fn show(&self) -> &ShowConfig {
        &self.show
    }

    pub async fn resolve(&self, number: u32, cancel: &CancellationToken) -> Resolution {
        let mut episode = Episode::placeholder(number, &self.show);

        let mirror = match &self.mirror {
            Some(mirror) => mirror.is_authenticated().await.then_some(mirror.as_ref()),
            None => None,
        };

        if let Some(mirror) = mirror {
            let dest = self.audio.path_for(number);
            let cached = self.audio.cached_path(number).is_some();
            if cached {
                debug!(episode = number, "audio already cached, not restoring from cloud");
            }
            if !cached && mirror.fetch_audio(number, &dest, cancel).await {
                info!(episode = number, "episode audio restored from cloud");
                if let Some(meta) = mirror.lookup_metadata(number).await {
                    episode.merge_from(meta);
                }
                return Resolution {
                    episode,
                    source: ResolutionSource::CloudAudio,
                    local_file: Some(dest),
                };
            }

            if let Some(meta) = mirror.lookup_metadata(number).await {
                episode.merge_from(meta);
                if let Some(url) = &episode.audio_url {
                    info!(episode = number, "audio url found in cloud metadata");
                    self.urls.insert(number, url.clone());
                    return self.finish(episode, ResolutionSource::CloudMetadata);
                }
            }
        }

        if let Some(feed) = &self.feed
            && let Some(found) = feed.lookup(number).await
        {
            episode.merge_from(found);
            if episode.has_audio() {
                return self
                    .finish_and_store(episode, ResolutionSource::Feed, mirror)
                    .await;
            }
        }

        if let Some(url) = self.urls.get(number) {
            debug!(episode = number, "using session url cache");
            episode.audio_url = Some(url);
            return self.finish(episode, ResolutionSource::UrlCache);
        }

        if let Some(scraper) = &self.scraper
            && let Some(url) = scraper.extract(&episode.page_url, cancel).await
        {
            self.urls.insert(number, url.clone());
            episode.audio_url = Some(url);
            return self
                .finish_and_store(episode, ResolutionSource::PageScrape, mirror)
                .await;
        }

        warn!(episode = number, "could not resolve audio url");
        self.finish(episode, ResolutionSource::Unresolved)
    }

    fn finish(&self, episode: Episode, source: ResolutionSource) -> Resolution {
        debug!(episode = episode.number, %source, "resolved");
        Resolution {
            episode,
            source,
            local_file: None,
        }
    }

    async fn finish_and_store(
        &self,
        episode: Episode,
        source: ResolutionSource,
        mirror: Option<&dyn EpisodeMirror>,
    ) -> Resolution {
        if let Some(mirror) = mirror {
            mirror.store_metadata(&episode).await;
        }
        self.finish(episode, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubFeed {
        episode: Option<Episode>,
        calls: AtomicUsize,
    }

    impl EpisodeSource for StubFeed {
        fn lookup(&self, _episode: u32) -> BoxFuture<'_, Option<Episode>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { self.episode.clone() })
        }
    }

    #[derive(Default)]
    struct StubScraper {
        url: Option<String>,
        calls: AtomicUsize,
    }

    impl AudioUrlExtractor for StubScraper {
        fn extract<'a>(
            &'a self,
            _page_url: &'a str,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { self.url.clone() })
        }
    }

    #[derive(Default)]
    struct StubMirror {
        authenticated: bool,
        has_audio: bool,
        metadata: Option<Episode>,
        stored: Mutex<Vec<u32>>,
        fetches: AtomicUsize,
    }

    impl EpisodeMirror for StubMirror {
        fn is_authenticated(&self) -> BoxFuture<'_, bool> {
            Box::pin(async move { self.authenticated })
        }

        fn fetch_audio<'a>(
            &'a self,
            _episode: u32,
            dest: &'a Path,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, bool> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if self.has_audio {
                    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
                    std::fs::write(dest, b"mirrored").unwrap();
                }
                self.has_audio
            })
        }

        fn lookup_metadata(&self, _episode: u32) -> BoxFuture<'_, Option<Episode>> {
            Box::pin(async move { self.metadata.clone() })
        }

        fn store_metadata<'a>(&'a self, episode: &'a Episode) -> BoxFuture<'a, ()> {
            self.stored.lock().unwrap().push(episode.number);
            Box::pin(async {})
        }
    }

    fn feed_episode(number: u32, url: Option<&str>) -> Episode {
        Episode {
            number,
            title: format!("Episode {}: Foo", number),
            description: "About foo".to_string(),
            audio_url: url.map(String::from),
            page_url: String::new(),
            publish_date: None,
        }
    }

    struct Harness {
        resolver: Resolver,
        feed: Arc<StubFeed>,
        scraper: Arc<StubScraper>,
        mirror: Arc<StubMirror>,
        _dir: tempfile::TempDir,
    }

    fn harness(feed: StubFeed, scraper: StubScraper, mirror: StubMirror) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(feed);
        let scraper = Arc::new(scraper);
        let mirror = Arc::new(mirror);
        let resolver = Resolver::new(
            ShowConfig::default(),
            AudioCache::new(dir.path(), "dotnetrocks"),
            EpisodeUrlCache::new(),
        )
        .with_feed(feed.clone())
        .with_scraper(scraper.clone())
        .with_mirror(mirror.clone());

        Harness {
            resolver,
            feed,
            scraper,
            mirror,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_cloud_audio_hit_skips_feed_and_scraper() {
        let h = harness(
            StubFeed::default(),
            StubScraper::default(),
            StubMirror {
                authenticated: true,
                has_audio: true,
                ..Default::default()
            },
        );

        let res = h.resolver.resolve(1001, &CancellationToken::new()).await;

        assert_eq!(res.source, ResolutionSource::CloudAudio);
        assert!(res.local_file.as_ref().unwrap().ends_with("dotnetrocks_1001.mp3"));
        assert_eq!(h.feed.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.scraper.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_audio_is_not_overwritten_by_cloud_copy() {
        let h = harness(
            StubFeed::default(),
            StubScraper::default(),
            StubMirror {
                authenticated: true,
                has_audio: true,
                metadata: Some(feed_episode(1001, Some("http://cdn/cloud.mp3"))),
                ..Default::default()
            },
        );
        let path = h._dir.path().join("dotnetrocks_1001.mp3");
        std::fs::write(&path, b"local").unwrap();

        let res = h.resolver.resolve(1001, &CancellationToken::new()).await;

        assert_eq!(h.mirror.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"local");
        assert_eq!(res.source, ResolutionSource::CloudMetadata);
        assert_eq!(res.episode.title, "Episode 1001: Foo");
    }

    #[tokio::test]
    async fn test_cloud_metadata_hit_skips_feed_and_scraper() {
        let h = harness(
            StubFeed::default(),
            StubScraper::default(),
            StubMirror {
                authenticated: true,
                metadata: Some(feed_episode(1001, Some("http://cdn/cloud.mp3"))),
                ..Default::default()
            },
        );

        let res = h.resolver.resolve(1001, &CancellationToken::new()).await;

        assert_eq!(res.source, ResolutionSource::CloudMetadata);
        assert_eq!(res.episode.audio_url.as_deref(), Some("http://cdn/cloud.mp3"));
        assert_eq!(h.feed.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.scraper.calls.load(Ordering::SeqCst), 0);
        assert!(h.mirror.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_feed_hit_skips_scraper_and_fills_mirror() {
        let h = harness(
            StubFeed {
                episode: Some(feed_episode(1001, Some("http://cdn/ep1001.mp3"))),
                ..Default::default()
            },
            StubScraper::default(),
            StubMirror {
                authenticated: true,
                ..Default::default()
            },
        );

        let res = h.resolver.resolve(1001, &CancellationToken::new()).await;

        assert_eq!(res.source, ResolutionSource::Feed);
        assert_eq!(res.episode.title, "Episode 1001: Foo");
        assert_eq!(h.scraper.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*h.mirror.stored.lock().unwrap(), vec![1001]);
    }

    #[tokio::test]
    async fn test_unauthenticated_mirror_is_not_consulted() {
        let h = harness(
            StubFeed {
                episode: Some(feed_episode(5, Some("http://cdn/ep5.mp3"))),
                ..Default::default()
            },
            StubScraper::default(),
            StubMirror {
                authenticated: false,
                has_audio: true,
                ..Default::default()
            },
        );

        let res = h.resolver.resolve(5, &CancellationToken::new()).await;

        assert_eq!(res.source, ResolutionSource::Feed);
        assert!(res.local_file.is_none());
        assert!(h.mirror.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scraper_used_when_feed_has_no_enclosure() {
        let h = harness(
            StubFeed {
                episode: Some(feed_episode(7, None)),
                ..Default::default()
            },
            StubScraper {
                url: Some("https://cdn/scraped.mp3".to_string()),
                ..Default::default()
            },
            StubMirror::default(),
        );

        let res = h.resolver.resolve(7, &CancellationToken::new()).await;

        assert_eq!(res.source, ResolutionSource::PageScrape);
        assert_eq!(res.episode.title, "Episode 7: Foo");
        assert_eq!(h.resolver.urls().get(7).as_deref(), Some("https://cdn/scraped.mp3"));
    }

    #[tokio::test]
    async fn test_url_cache_checked_before_scraper() {
        let h = harness(StubFeed::default(), StubScraper::default(), StubMirror::default());
        h.resolver.urls().insert(9, "http://cdn/cached.mp3");

        let res = h.resolver.resolve(9, &CancellationToken::new()).await;

        assert_eq!(res.source, ResolutionSource::UrlCache);
        assert_eq!(h.scraper.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_sources_failing_yields_placeholder() {
        let h = harness(StubFeed::default(), StubScraper::default(), StubMirror::default());

        let res = h.resolver.resolve(12, &CancellationToken::new()).await;

        assert_eq!(res.source, ResolutionSource::Unresolved);
        assert!(!res.is_resolved());
        assert_eq!(res.episode.title, ".NET Rocks! Episode 12");
        assert_eq!(h.feed.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.scraper.calls.load(Ordering::SeqCst), 1);
    }
}
