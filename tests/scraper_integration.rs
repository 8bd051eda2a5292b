use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rocksync::config::ScraperConfig;
use rocksync::scraper::{HttpSurfaceFactory, PageScraper};

fn scraper() -> PageScraper {
    let config = ScraperConfig {
        settle_ms: 0,
        retry_delay_ms: 0,
        ..Default::default()
    };
    PageScraper::new(Arc::new(HttpSurfaceFactory::new().unwrap()), &config)
}

#[tokio::test]
async fn test_extracts_protocol_relative_source() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/details/1001"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body>
                <h1>Episode 1001: Foo</h1>
                <audio controls><source src="//cdn.example/ep1001.mp3?x=1" type="audio/mpeg"></audio>
            </body></html>"#,
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let url = scraper()
        .extract_audio_url(
            &format!("{}/details/1001", mock_server.uri()),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(url.as_deref(), Some("https://cdn.example/ep1001.mp3?x=1"));
}

#[tokio::test]
async fn test_page_without_audio_gives_up_after_retries() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/details/2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>no audio</html>"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let url = scraper()
        .extract_audio_url(
            &format!("{}/details/2", mock_server.uri()),
            &CancellationToken::new(),
        )
        .await;

    assert!(url.is_none());
}

#[tokio::test]
async fn test_missing_page_is_not_found() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/details/3"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let url = scraper()
        .extract_audio_url(
            &format!("{}/details/3", mock_server.uri()),
            &CancellationToken::new(),
        )
        .await;

    assert!(url.is_none());
}
