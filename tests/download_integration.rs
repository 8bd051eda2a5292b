use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use rocksync::download::{AudioCache, DownloadEngine, DownloadError, NoProgress, part_path};

/// What the hand-rolled server does after writing `head` and `body`.
#[derive(Clone, Copy)]
enum Then {
    Close,
    Stall,
}

/// Serves one raw HTTP response, for bodies wiremock cannot produce.
async fn serve_once(head: &'static str, body: &'static [u8], then: Then) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(body).await.unwrap();
        socket.flush().await.unwrap();
        if let Then::Stall = then {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    });
    format!("http://{}/ep.mp3", addr)
}

fn engine(dir: &std::path::Path) -> DownloadEngine {
    DownloadEngine::new(AudioCache::new(dir, "dotnetrocks")).unwrap()
}

#[tokio::test]
async fn test_chunked_body_without_length_reports_no_progress() {
    let url = serve_once(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
        b"4\r\nID3\x04\r\n3\r\nabc\r\n0\r\n\r\n",
        Then::Close,
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    let reports = Mutex::new(Vec::new());
    let progress = |fraction: f64| reports.lock().unwrap().push(fraction);
    let path = engine
        .download(1, &url, &progress, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"ID3\x04abc");
    assert!(reports.lock().unwrap().is_empty());
    assert!(!part_path(&path).exists());
}

#[tokio::test]
async fn test_truncated_body_leaves_nothing_behind() {
    let url = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Length: 100000\r\nConnection: close\r\n\r\n",
        b"0123456789",
        Then::Close,
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    let result = engine
        .download(2, &url, &NoProgress, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(DownloadError::RequestError(_))));
    assert!(engine.cache().cached_path(2).is_none());
    assert!(!part_path(&engine.cache().path_for(2)).exists());
}

#[tokio::test]
async fn test_cancel_mid_stream_removes_partial_file() {
    let url = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n",
        b"0123456789",
        Then::Stall,
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    let cancel = CancellationToken::new();
    let reports = Mutex::new(Vec::new());
    let progress = |fraction: f64| {
        reports.lock().unwrap().push(fraction);
        cancel.cancel();
    };
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        engine.download(3, &url, &progress, &cancel),
    )
    .await
    .unwrap();

    assert!(matches!(result, Err(DownloadError::Cancelled)));
    assert_eq!(reports.lock().unwrap().len(), 1);
    assert!(engine.cache().cached_path(3).is_none());
    assert!(!part_path(&engine.cache().path_for(3)).exists());
}
