// HEAD probe against a fake upstream.

use std::net::SocketAddr;

use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use rapidget_engine::source::{DownloadSource, HttpSource};
use rapidget_engine::EngineError;

const TEST_SIZE: usize = 1024 * 1024; // 1 MB

/// Range-aware upstream serving `TEST_SIZE` bytes of a counting pattern.
async fn serve_plain(req: Request) -> impl IntoResponse {
    let body: Vec<u8> = (0..TEST_SIZE).map(|i| (i % 256) as u8).collect();
    let total = body.len() as u64;

    if let Some(range_val) = req.headers().get(header::RANGE).and_then(|v| v.to_str().ok()) {
        if let Some(rest) = range_val.strip_prefix("bytes=") {
            let mut parts = rest.splitn(2, '-');
            let start: u64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
            let end_str = parts.next().unwrap_or("");
            let end: u64 = if end_str.is_empty() {
                total - 1
            } else {
                end_str.parse().unwrap_or(total - 1)
            };
            let end = end.min(total - 1);
            let slice = body[start as usize..=end as usize].to_vec();
            let content_range = format!("bytes {}-{}/{}", start, end, total);
            return (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (header::CONTENT_RANGE, content_range),
                ],
                slice,
            )
                .into_response();
        }
    }

    (
        StatusCode::OK,
        [(header::ACCEPT_RANGES, "bytes".to_string())],
        body,
    )
        .into_response()
}

async fn serve_with_disposition() -> impl IntoResponse {
    let body: Vec<u8> = vec![0u8; TEST_SIZE];
    (
        StatusCode::OK,
        [
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (
                header::CONTENT_DISPOSITION,
                r#"attachment; filename="my%20archive.tar.gz""#.to_string(),
            ),
        ],
        body,
    )
}

async fn serve_no_ranges() -> impl IntoResponse {
    (StatusCode::OK, vec![1u8; 100])
}

async fn serve_empty() -> impl IntoResponse {
    (StatusCode::OK, Vec::<u8>::new())
}

async fn start_server() -> SocketAddr {
    let app = Router::new()
        .route("/file.bin", get(serve_plain))
        .route("/tagged", get(serve_with_disposition))
        .route("/plain", get(serve_no_ranges))
        .route("/empty", get(serve_empty));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

#[tokio::test]
async fn test_probe_reads_length_and_pause_support() {
    let addr = start_server().await;
    let source = HttpSource::new(format!("http://{}/file.bin?token=abc", addr));

    let info = source.probe().await.unwrap();
    assert_eq!(info.content_length, TEST_SIZE as u64);
    assert!(info.supports_pause);
    // Falls back to the URL path segment, query stripped.
    assert_eq!(info.file_name, "file.bin");
}

#[tokio::test]
async fn test_probe_prefers_content_disposition() {
    let addr = start_server().await;
    let source = HttpSource::new(format!("http://{}/tagged", addr));

    let info = source.probe().await.unwrap();
    // Quoted filename, percent-decoded.
    assert_eq!(info.file_name, "my archive.tar.gz");
}

#[tokio::test]
async fn test_probe_without_accept_ranges() {
    let addr = start_server().await;
    let source = HttpSource::new(format!("http://{}/plain", addr));

    let info = source.probe().await.unwrap();
    assert!(!info.supports_pause);
}

#[tokio::test]
async fn test_probe_rejects_empty_content() {
    let addr = start_server().await;
    let source = HttpSource::new(format!("http://{}/empty", addr));

    match source.probe().await {
        Err(EngineError::UnsupportedSource(_)) => {}
        other => panic!("expected UnsupportedSource, got {:?}", other.map(|i| i.content_length)),
    }
}

#[tokio::test]
async fn test_fetch_range_streams_exact_bytes() {
    use futures::StreamExt;
    use rapidget_engine::Segment;

    let addr = start_server().await;
    let source = HttpSource::new(format!("http://{}/file.bin", addr));

    let mut stream = source.fetch_range(Segment::new(0, 4_095)).await.unwrap();
    let mut received = 0u64;
    while let Some(chunk) = stream.next().await {
        received += chunk.unwrap().len() as u64;
    }
    assert_eq!(received, 4_096);
}
