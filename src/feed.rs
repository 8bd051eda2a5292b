use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, ShowConfig};
use crate::episode::{Episode, EpisodeUrlCache};
use crate::resolver::EpisodeSource;

const FEED_FILE: &str = "rss_feed.xml";
const FEED_META_FILE: &str = "rss_feed.meta";

/// Large feeds over slow links must not be cut short.
const FEED_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Tried in order; the first one whose capture equals the wanted number wins.
static TITLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"Episode\s+(\d+)",
        r"Show\s+#?(\d+)",
        r"^(\d+):",
        r"#(\d+)\s",
        r"\s(\d{4})\s",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

static ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[a-zA-Z][a-zA-Z0-9]*);").unwrap());

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("xml parse error: {0}")]
    XmlError(#[from] quick_xml::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("cache io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One `<item>` of the feed, before it is matched to an episode number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub description: String,
    pub pub_date: Option<String>,
    pub enclosure_url: Option<String>,
}

impl FeedItem {
    pub fn matches_episode(&self, episode: u32) -> bool {
        title_matches(&self.title, episode)
    }

    pub fn into_episode(self, episode: u32, show: &ShowConfig) -> Episode {
        Episode {
            number: episode,
            description: clean_description(&self.description),
            publish_date: self.pub_date.as_deref().and_then(parse_pub_date),
            audio_url: self.enclosure_url.filter(|u| !u.is_empty()),
            page_url: show.page_url(episode),
            title: self.title,
        }
    }
}

/// Feed document cached on disk next to a plain-text fetch timestamp.
pub struct FeedCache {
    client: Client,
    feed_url: String,
    cache_dir: PathBuf,
    max_age: chrono::Duration,
}

impl FeedCache {
    pub fn new(config: &Config) -> Result<Self, FeedError> {
        Self::with_feed_url(
            &config.show.feed_url,
            config.storage.cache_dir(),
            config.storage.feed_max_age(),
        )
    }

    /// Create a cache against a custom feed URL (for testing)
    pub fn with_feed_url(
        feed_url: &str,
        cache_dir: impl Into<PathBuf>,
        max_age: chrono::Duration,
    ) -> Result<Self, FeedError> {
        let client = Client::builder()
            .timeout(FEED_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            feed_url: feed_url.to_string(),
            cache_dir: cache_dir.into(),
            max_age,
        })
    }

    pub fn feed_path(&self) -> PathBuf {
        self.cache_dir.join(FEED_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.cache_dir.join(FEED_META_FILE)
    }

    /// Cached document if younger than the freshness window, otherwise a fresh
    /// fetch. `None` when neither is available.
    pub async fn get_feed(&self) -> Option<String> {
        if let Some(cached) = self.read_fresh().await {
            return Some(cached);
        }

        match self.fetch().await {
            Ok(document) => {
                if let Err(e) = self.persist(&document).await {
                    warn!(error = %e, "failed to cache feed");
                }
                Some(document)
            }
            Err(e) => {
                warn!(error = %e, url = %self.feed_url, "feed fetch failed");
                None
            }
        }
    }

    pub async fn fetched_at(&self) -> Option<DateTime<Utc>> {
        let meta = tokio::fs::read_to_string(self.meta_path()).await.ok()?;
        DateTime::parse_from_rfc3339(meta.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    async fn read_fresh(&self) -> Option<String> {
        let fetched_at = self.fetched_at().await?;
        if !is_fresh(fetched_at, Utc::now(), self.max_age) {
            debug!(%fetched_at, "cached feed is stale");
            return None;
        }

        match tokio::fs::read_to_string(self.feed_path()).await {
            Ok(document) => {
                debug!(%fetched_at, "using cached feed");
                Some(document)
            }
            Err(e) => {
                debug!(error = %e, "cached feed missing");
                None
            }
        }
    }

    async fn fetch(&self) -> Result<String, FeedError> {
        info!(url = %self.feed_url, "fetching feed");
        let response = self.client.get(&self.feed_url).send().await?;

        if !response.status().is_success() {
            return Err(FeedError::InvalidResponse(format!(
                "status: {}",
                response.status()
            )));
        }

        Ok(response.text().await?)
    }

    async fn persist(&self, document: &str) -> Result<(), FeedError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::write(self.feed_path(), document).await?;
        tokio::fs::write(self.meta_path(), Utc::now().to_rfc3339()).await?;
        debug!(bytes = document.len(), "feed cached");
        Ok(())
    }

    /// Remove the cached document and its timestamp. Errors are logged only.
    pub async fn clear(&self) {
        for path in [self.feed_path(), self.meta_path()] {
            remove_quietly(&path).await;
        }
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = %path.display(), "failed to remove"),
    }
}

pub fn is_fresh(fetched_at: DateTime<Utc>, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    now - fetched_at < max_age
}

/// Feed lookups for the resolver. A matched enclosure URL also lands in the
/// session URL cache.
pub struct FeedSource {
    cache: FeedCache,
    urls: EpisodeUrlCache,
    show: ShowConfig,
}

impl FeedSource {
    pub fn new(cache: FeedCache, urls: EpisodeUrlCache, show: ShowConfig) -> Self {
        Self { cache, urls, show }
    }

    pub fn cache(&self) -> &FeedCache {
        &self.cache
    }

    pub async fn resolve_from_feed(&self, episode: u32) -> Option<Episode> {
        let document = self.cache.get_feed().await?;

        let items = match parse_items(&document) {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "failed to parse feed");
                return None;
            }
        };

        let Some(item) = items.into_iter().find(|item| item.matches_episode(episode)) else {
            debug!(episode, "episode not in feed");
            return None;
        };

        let found = item.into_episode(episode, &self.show);
        match &found.audio_url {
            Some(url) => {
                info!(episode, url = %url, "found episode in feed");
                self.urls.insert(episode, url.clone());
            }
            None => debug!(episode, "found episode in feed without enclosure"),
        }
        Some(found)
    }
}

impl EpisodeSource for FeedSource {
    fn lookup(&self, episode: u32) -> BoxFuture<'_, Option<Episode>> {
        Box::pin(self.resolve_from_feed(episode))
    }
}

pub fn title_matches(title: &str, episode: u32) -> bool {
    TITLE_PATTERNS.iter().any(|pattern| {
        pattern
            .captures(title)
            .and_then(|c| c[1].parse::<u32>().ok())
            .is_some_and(|n| n == episode)
    })
}

/// Strip markup from a description and decode what the markup escaped.
pub fn clean_description(raw: &str) -> String {
    let stripped = TAG.replace_all(raw, "");
    decode_entities(stripped.trim()).trim().to_string()
}

pub fn parse_pub_date(raw: &str) -> Option<chrono::NaiveDate> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|d| d.date_naive())
        .ok()
}

/// Decode named and numeric character references. Unknown names are kept.
pub fn decode_entities(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &regex::Captures| {
            let body = &caps[1];
            let decoded = if let Some(hex) = body.strip_prefix("#x").or(body.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse().ok().and_then(char::from_u32)
            } else {
                named_entity(body)
            };

            decoded
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "ndash" => '\u{2013}',
        "mdash" => '\u{2014}',
        "lsquo" => '\u{2018}',
        "rsquo" => '\u{2019}',
        "ldquo" => '\u{201c}',
        "rdquo" => '\u{201d}',
        "hellip" => '\u{2026}',
        "copy" => '\u{a9}',
        "reg" => '\u{ae}',
        "trade" => '\u{2122}',
        _ => return None,
    })
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    Title,
    Description,
    PubDate,
}

/// Parse every `<item>` of an RSS document.
pub fn parse_items(xml: &str) -> Result<Vec<FeedItem>, FeedError> {
    let mut reader = Reader::from_str(xml);

    let mut items = Vec::new();
    let mut current_item: Option<FeedItem> = None;
    let mut field = Field::None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"item" => current_item = Some(FeedItem::default()),
                b"title" => field = Field::Title,
                b"description" => field = Field::Description,
                b"pubDate" => field = Field::PubDate,
                b"enclosure" => {
                    if let Some(ref mut item) = current_item {
                        item.enclosure_url = enclosure_url(e);
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() == b"enclosure"
                    && let Some(ref mut item) = current_item
                {
                    item.enclosure_url = enclosure_url(e);
                }
            }
            Ok(Event::Text(ref e)) => {
                if field != Field::None {
                    text.push_str(&decode_entities(&String::from_utf8_lossy(e)));
                }
            }
            Ok(Event::GeneralRef(ref e)) => {
                if field != Field::None {
                    let reference = format!("&{};", String::from_utf8_lossy(e));
                    text.push_str(&decode_entities(&reference));
                }
            }
            Ok(Event::CData(ref e)) => {
                if field != Field::None {
                    text.push_str(&String::from_utf8_lossy(e));
                }
            }
            Ok(Event::End(ref e)) => {
                let name = e.name();
                if name.as_ref() == b"item" {
                    if let Some(item) = current_item.take()
                        && !item.title.is_empty()
                    {
                        items.push(item);
                    }
                } else if field != Field::None {
                    let value = std::mem::take(&mut text).trim().to_string();
                    if let Some(ref mut item) = current_item {
                        match field {
                            Field::Title => item.title = value,
                            Field::Description => item.description = value,
                            Field::PubDate => item.pub_date = Some(value),
                            Field::None => {}
                        }
                    }
                    field = Field::None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FeedError::XmlError(e)),
            _ => {}
        }
    }

    Ok(items)
}

fn enclosure_url(e: &quick_xml::events::BytesStart) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == b"url")
        .map(|attr| decode_entities(&String::from_utf8_lossy(&attr.value)))
        .filter(|url| !url.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>.NET Rocks!</title>
    <item>
      <title>Episode 1002: Bar &amp; Baz</title>
      <itunes:title>Something else</itunes:title>
      <description>&lt;p&gt;Carl &amp;amp; Richard talk &lt;b&gt;Bar&lt;/b&gt;&lt;/p&gt;</description>
      <pubDate>Tue, 10 Jun 2014 00:00:00 -0400</pubDate>
      <enclosure url="http://cdn/ep1002.mp3" length="100" type="audio/mpeg"/>
    </item>
    <item>
      <title>Episode 1001: Foo</title>
      <description><![CDATA[<p>All about Foo</p>]]></description>
      <pubDate>Tue, 03 Jun 2014 00:00:00 -0400</pubDate>
      <enclosure url="http://cdn/ep1001.mp3" length="100" type="audio/mpeg"/>
    </item>
    <item>
      <title>Show #999 - No enclosure</title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_title_patterns() {
        assert!(title_matches("Episode 1001: Foo", 1001));
        assert!(title_matches("Show #999 - No enclosure", 999));
        assert!(title_matches("Show 998 recap", 998));
        assert!(title_matches("1500: Leading number", 1500));
        assert!(title_matches("Talk #77 about things", 77));
        assert!(title_matches("The 1999 show", 1999));
        assert!(!title_matches("Episode 1001: Foo", 100));
        assert!(!title_matches("No number here", 1));
    }

    #[test]
    fn test_parse_items() {
        let items = parse_items(FEED).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].title, "Episode 1002: Bar & Baz");
        assert_eq!(items[0].enclosure_url.as_deref(), Some("http://cdn/ep1002.mp3"));
        assert_eq!(items[1].description, "<p>All about Foo</p>");
        assert_eq!(items[2].enclosure_url, None);
    }

    #[test]
    fn test_item_into_episode() {
        let item = parse_items(FEED)
            .unwrap()
            .into_iter()
            .find(|i| i.matches_episode(1002))
            .unwrap();

        let episode = item.into_episode(1002, &ShowConfig::default());
        assert_eq!(episode.description, "Carl & Richard talk Bar");
        assert_eq!(
            episode.publish_date,
            chrono::NaiveDate::from_ymd_opt(2014, 6, 10)
        );
        assert_eq!(episode.page_url, "https://www.dotnetrocks.com/details/1002");
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &amp; b"), "a & b");
        assert_eq!(decode_entities("&#8217;&#x2019;"), "\u{2019}\u{2019}");
        assert_eq!(decode_entities("&bogus; stays"), "&bogus; stays");
    }

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        let day = chrono::Duration::hours(24);
        assert!(is_fresh(now - chrono::Duration::minutes(23 * 60 + 59), now, day));
        assert!(!is_fresh(now - chrono::Duration::minutes(24 * 60 + 1), now, day));
    }

    #[test]
    fn test_parse_malformed_feed() {
        assert!(parse_items("<rss><channel><item><title>x</channel>").is_err());
    }
}
