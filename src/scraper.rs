use futures::future::BoxFuture;
use regex::Regex;
use reqwest::Client;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScraperConfig;
use crate::feed::USER_AGENT;
use crate::resolver::AudioUrlExtractor;

static AUDIO_SOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<source\s+[^>]*src=["']([^"']+\.mp3[^"']*)["']"#).unwrap()
});

static ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\(u[0-9a-fA-F]{4}|.)").unwrap());

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("surface error: {0}")]
    Surface(String),
}

/// A page-rendering surface. Implementations are driven from one task at a
/// time and are always closed by the scraper, whatever the outcome.
pub trait BrowserSurface: Send {
    fn navigate<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<(), ScrapeError>>;

    /// Current document markup, `None` while nothing has rendered.
    fn rendered_markup(&mut self) -> BoxFuture<'_, Result<Option<String>, ScrapeError>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub trait SurfaceFactory: Send + Sync {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn BrowserSurface>, ScrapeError>>;
}

/// Surface that renders nothing client-side: the markup is the server response.
pub struct HttpPageSurface {
    client: Client,
    markup: Option<String>,
}

impl BrowserSurface for HttpPageSurface {
    fn navigate<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<(), ScrapeError>> {
        Box::pin(async move {
            let response = self.client.get(url).send().await?;
            if !response.status().is_success() {
                return Err(ScrapeError::Navigation(format!(
                    "status: {}",
                    response.status()
                )));
            }
            self.markup = Some(response.text().await?);
            Ok(())
        })
    }

    fn rendered_markup(&mut self) -> BoxFuture<'_, Result<Option<String>, ScrapeError>> {
        Box::pin(async move { Ok(self.markup.clone()) })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.markup = None;
        })
    }
}

pub struct HttpSurfaceFactory {
    client: Client,
}

impl HttpSurfaceFactory {
    pub fn new() -> Result<Self, ScrapeError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

impl SurfaceFactory for HttpSurfaceFactory {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn BrowserSurface>, ScrapeError>> {
        let surface = HttpPageSurface {
            client: self.client.clone(),
            markup: None,
        };
        Box::pin(async move { Ok(Box::new(surface) as Box<dyn BrowserSurface>) })
    }
}

/// Fallback extractor that reads the audio source out of an episode page.
pub struct PageScraper {
    factory: Arc<dyn SurfaceFactory>,
    settle: Duration,
    attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
}

impl PageScraper {
    pub fn new(factory: Arc<dyn SurfaceFactory>, config: &ScraperConfig) -> Self {
        Self {
            factory,
            settle: config.settle_delay(),
            attempts: config.attempts.max(1),
            retry_delay: config.retry_delay(),
            timeout: config.timeout(),
        }
    }

    pub async fn extract_audio_url(
        &self,
        page_url: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        info!(url = %page_url, "scraping page for audio url");

        let mut surface = match self.factory.open().await {
            Ok(surface) => surface,
            Err(e) => {
                warn!(error = %e, "failed to open browser surface");
                return None;
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(url = %page_url, "scrape cancelled");
                None
            }
            result = tokio::time::timeout(self.timeout, self.scrape(surface.as_mut(), page_url)) => {
                match result {
                    Ok(Ok(url)) => url,
                    Ok(Err(e)) => {
                        warn!(error = %e, url = %page_url, "scrape failed");
                        None
                    }
                    Err(_) => {
                        warn!(url = %page_url, timeout_secs = self.timeout.as_secs(), "scrape timed out");
                        None
                    }
                }
            }
        };

        surface.close().await;

        match &outcome {
            Some(url) => info!(url = %url, "found audio url on page"),
            None => debug!(url = %page_url, "no audio url on page"),
        }
        outcome
    }

    async fn scrape(
        &self,
        surface: &mut dyn BrowserSurface,
        page_url: &str,
    ) -> Result<Option<String>, ScrapeError> {
        surface.navigate(page_url).await?;
        tokio::time::sleep(self.settle).await;

        for attempt in 1..=self.attempts {
            match surface.rendered_markup().await {
                Ok(Some(markup)) => {
                    if let Some(url) = find_audio_source(&unescape_markup(&markup)) {
                        return Ok(Some(url));
                    }
                    debug!(attempt, "no audio source rendered yet");
                }
                Ok(None) => debug!(attempt, "page not rendered yet"),
                Err(e) => debug!(attempt, error = %e, "markup extraction failed"),
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Ok(None)
    }
}

impl AudioUrlExtractor for PageScraper {
    fn extract<'a>(
        &'a self,
        page_url: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Option<String>> {
        Box::pin(self.extract_audio_url(page_url, cancel))
    }
}

/// First `.mp3` `<source>` URL in the markup; protocol-relative URLs become https.
pub fn find_audio_source(markup: &str) -> Option<String> {
    let url = AUDIO_SOURCE.captures(markup)?.get(1)?.as_str();
    if url.starts_with("//") {
        Some(format!("https:{}", url))
    } else {
        Some(url.to_string())
    }
}

/// Markup returned from script evaluation arrives as an escaped string literal.
pub fn unescape_markup(raw: &str) -> String {
    let raw = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);

    ESCAPE
        .replace_all(raw, |caps: &regex::Captures| {
            let body = &caps[1];
            if let Some(hex) = body.strip_prefix('u') {
                return u32::from_str_radix(hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .map(String::from)
                    .unwrap_or_else(|| caps[0].to_string());
            }
            match body {
                "n" => "\n".to_string(),
                "r" => "\r".to_string(),
                "t" => "\t".to_string(),
                other => other.to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        reads: AtomicUsize,
        closed: AtomicUsize,
    }

    /// Serves a fixed sequence of markup snapshots; `None` in the script
    /// means the surface hangs on that read.
    struct ScriptedSurface {
        script: Arc<Mutex<Vec<Option<String>>>>,
        counters: Arc<Counters>,
    }

    impl BrowserSurface for ScriptedSurface {
        fn navigate<'a>(&'a mut self, _url: &'a str) -> BoxFuture<'a, Result<(), ScrapeError>> {
            Box::pin(async { Ok(()) })
        }

        fn rendered_markup(&mut self) -> BoxFuture<'_, Result<Option<String>, ScrapeError>> {
            self.counters.reads.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    Some(String::new())
                } else {
                    script.remove(0)
                }
            };
            Box::pin(async move {
                match next {
                    Some(markup) => Ok(Some(markup)),
                    None => futures::future::pending().await,
                }
            })
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    struct ScriptedFactory {
        script: Arc<Mutex<Vec<Option<String>>>>,
        counters: Arc<Counters>,
    }

    impl SurfaceFactory for ScriptedFactory {
        fn open(&self) -> BoxFuture<'_, Result<Box<dyn BrowserSurface>, ScrapeError>> {
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            let surface = ScriptedSurface {
                script: self.script.clone(),
                counters: self.counters.clone(),
            };
            Box::pin(async move { Ok(Box::new(surface) as Box<dyn BrowserSurface>) })
        }
    }

    fn scraper(script: Vec<Option<&str>>) -> (PageScraper, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let factory = ScriptedFactory {
            script: Arc::new(Mutex::new(
                script.into_iter().map(|s| s.map(String::from)).collect(),
            )),
            counters: counters.clone(),
        };
        (
            PageScraper::new(Arc::new(factory), &ScraperConfig::default()),
            counters,
        )
    }

    #[test]
    fn test_find_audio_source() {
        let html = r#"<audio><SOURCE type="audio/mpeg" src="//cdn.example.com/dnr1001.mp3?x=1"></audio>"#;
        assert_eq!(
            find_audio_source(html).as_deref(),
            Some("https://cdn.example.com/dnr1001.mp3?x=1")
        );
        assert_eq!(find_audio_source("<source src='a.ogg'>"), None);
    }

    #[test]
    fn test_unescape_markup() {
        let raw = r#""<source src=\"http://cdn/a.mp3\"> <p>""#;
        assert_eq!(unescape_markup(raw), r#"<source src="http://cdn/a.mp3"> <p>"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_rendered() {
        let (scraper, counters) = scraper(vec![
            Some("<html></html>"),
            Some(r#"<source src="http://cdn/ep.mp3">"#),
        ]);

        let url = scraper
            .extract_audio_url("http://page", &CancellationToken::new())
            .await;

        assert_eq!(url.as_deref(), Some("http://cdn/ep.mp3"));
        assert_eq!(counters.reads.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempts() {
        let (scraper, counters) = scraper(vec![]);

        let url = scraper
            .extract_audio_url("http://page", &CancellationToken::new())
            .await;

        assert_eq!(url, None);
        assert_eq!(counters.reads.load(Ordering::SeqCst), 3);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_timeout_closes_surface() {
        let (scraper, counters) = scraper(vec![None]);

        let url = scraper
            .extract_audio_url("http://page", &CancellationToken::new())
            .await;

        assert_eq!(url, None);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_scrape_closes_surface() {
        let (scraper, counters) = scraper(vec![None]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(scraper.extract_audio_url("http://page", &cancel).await, None);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }
}
