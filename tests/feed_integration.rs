use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rocksync::config::Config;
use rocksync::download::{AudioCache, DownloadEngine};
use rocksync::episode::EpisodeUrlCache;
use rocksync::feed::{FeedCache, FeedSource};
use rocksync::library::EpisodeLibrary;
use rocksync::resolver::{AudioUrlExtractor, ResolutionSource};

fn feed_document(audio_base: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>.NET Rocks!</title>
    <item>
      <title>Episode 1001: Foo</title>
      <description>All about Foo</description>
      <pubDate>Tue, 03 Jun 2014 00:00:00 -0400</pubDate>
      <enclosure url="{}/ep1001.mp3" length="4" type="audio/mpeg"/>
    </item>
  </channel>
</rss>"#,
        audio_base
    )
}

fn seed_cache(dir: &std::path::Path, document: &str, age: chrono::Duration) {
    std::fs::write(dir.join("rss_feed.xml"), document).unwrap();
    std::fs::write(dir.join("rss_feed.meta"), (Utc::now() - age).to_rfc3339()).unwrap();
}

/// Counts calls and never finds anything.
#[derive(Default)]
struct CountingScraper {
    calls: Mutex<u32>,
}

impl AudioUrlExtractor for CountingScraper {
    fn extract<'a>(
        &'a self,
        _page_url: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Option<String>> {
        *self.calls.lock().unwrap() += 1;
        Box::pin(async { None })
    }
}

#[tokio::test]
async fn test_fresh_cache_skips_network() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<rss/>"))
        .expect(0)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let cached = feed_document("http://cdn");
    seed_cache(
        dir.path(),
        &cached,
        chrono::Duration::hours(23) + chrono::Duration::minutes(59),
    );

    let cache = FeedCache::with_feed_url(
        &format!("{}/feed", mock_server.uri()),
        dir.path(),
        chrono::Duration::hours(24),
    )
    .unwrap();

    assert_eq!(cache.get_feed().await.as_deref(), Some(cached.as_str()));
}

#[tokio::test]
async fn test_stale_cache_is_refetched() {
    let mock_server = MockServer::start().await;
    let fresh = feed_document("http://cdn2");
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(200).set_body_string(fresh.clone()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    seed_cache(
        dir.path(),
        &feed_document("http://cdn"),
        chrono::Duration::hours(24) + chrono::Duration::minutes(1),
    );

    let cache = FeedCache::with_feed_url(
        &format!("{}/feed", mock_server.uri()),
        dir.path(),
        chrono::Duration::hours(24),
    )
    .unwrap();

    let before = Utc::now();
    assert_eq!(cache.get_feed().await.as_deref(), Some(fresh.as_str()));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("rss_feed.xml")).unwrap(),
        fresh
    );
    assert!(cache.fetched_at().await.unwrap() >= before - chrono::Duration::seconds(1));
}

#[tokio::test]
async fn test_fetch_failure_without_cache_returns_none() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let cache = FeedCache::with_feed_url(
        &format!("{}/feed", mock_server.uri()),
        dir.path(),
        chrono::Duration::hours(24),
    )
    .unwrap();

    assert!(cache.get_feed().await.is_none());
    assert!(!dir.path().join("rss_feed.xml").exists());
}

#[tokio::test]
async fn test_feed_episode_downloads_end_to_end() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(feed_document(&mock_server.uri())),
        )
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ep1001.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3\x04".to_vec()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.cache_dir = Some(dir.path().join("cache"));
    config.storage.data_dir = Some(dir.path().join("data"));

    let urls = EpisodeUrlCache::new();
    let feed = FeedSource::new(
        FeedCache::with_feed_url(
            &format!("{}/feed", mock_server.uri()),
            config.storage.cache_dir(),
            config.storage.feed_max_age(),
        )
        .unwrap(),
        urls.clone(),
        config.show.clone(),
    );
    let scraper = Arc::new(CountingScraper::default());
    let engine = DownloadEngine::new(AudioCache::new(
        config.storage.audio_dir(),
        &config.show.file_prefix,
    ))
    .unwrap();
    let library = EpisodeLibrary::with_engine(&config, engine, urls.clone())
        .with_feed(Arc::new(feed))
        .with_scraper(scraper.clone());

    let reports = Mutex::new(Vec::new());
    let progress = |fraction: f64| reports.lock().unwrap().push(fraction);
    let fetched = library
        .download(1001, &progress, &CancellationToken::new())
        .await
        .unwrap();

    let resolution = fetched.resolution.expect("freshly resolved");
    assert_eq!(resolution.source, ResolutionSource::Feed);
    assert_eq!(resolution.episode.title, "Episode 1001: Foo");
    assert_eq!(
        resolution.episode.audio_url,
        Some(format!("{}/ep1001.mp3", mock_server.uri()))
    );
    assert!(fetched.path.ends_with("dotnetrocks_1001.mp3"));
    assert_eq!(std::fs::read(&fetched.path).unwrap(), b"ID3\x04");
    assert_eq!(reports.lock().unwrap().last().copied(), Some(1.0));
    assert_eq!(*scraper.calls.lock().unwrap(), 0);
    assert_eq!(
        urls.get(1001),
        Some(format!("{}/ep1001.mp3", mock_server.uri()))
    );

    // Second call is served from disk without touching the network
    let again = library
        .download(1001, &progress, &CancellationToken::new())
        .await
        .unwrap();
    assert!(again.was_cached());
    assert_eq!(again.path, fetched.path);
}
