// Connection worker protocol: handshake, refresh negotiation (accept and
// overlap), pause/resume, and completion signalling. The worker is driven
// directly through its channels against an in-memory source.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use rapidget_engine::config::DownloadSettings;
use rapidget_engine::engine::messages::{
    Command, DownloadCommand, DownloadItem, InternalSegmentMessage, TransferStatus, WorkerMessage,
};
use rapidget_engine::engine::worker::ConnectionWorker;
use rapidget_engine::error::EngineError;
use rapidget_engine::source::{ByteStream, DownloadSource, FileInfo};
use rapidget_engine::store::TempFileStore;
use rapidget_engine::Segment;

const CONTENT_LENGTH: u64 = 1_000_000;

fn pattern(range: Segment) -> Bytes {
    (range.start..=range.end)
        .map(|i| (i % 256) as u8)
        .collect::<Vec<u8>>()
        .into()
}

/// Serves the counting pattern in fixed chunks with a per-chunk delay, so
/// tests can interleave commands with a download in flight.
struct PatternSource {
    chunk: u64,
    delay: Duration,
}

#[async_trait]
impl DownloadSource for PatternSource {
    async fn probe(&self) -> Result<FileInfo, EngineError> {
        Ok(FileInfo {
            supports_pause: true,
            file_name: "pattern.bin".into(),
            content_length: CONTENT_LENGTH,
        })
    }

    async fn fetch_range(&self, segment: Segment) -> Result<ByteStream, EngineError> {
        let mut chunks = Vec::new();
        let mut start = segment.start;
        while start <= segment.end {
            let end = (start + self.chunk - 1).min(segment.end);
            chunks.push(Segment::new(start, end));
            start = end + 1;
        }
        let delay = self.delay;
        let stream = futures::stream::iter(chunks).then(move |range| async move {
            tokio::time::sleep(delay).await;
            Ok(pattern(range))
        });
        Ok(stream.boxed())
    }
}

struct Harness {
    command_tx: mpsc::Sender<DownloadCommand>,
    event_rx: mpsc::Receiver<(Uuid, WorkerMessage)>,
    item: DownloadItem,
    settings: DownloadSettings,
    _temp: tempfile::TempDir,
}

fn start_worker(chunk: u64, delay: Duration) -> Harness {
    let temp = tempfile::tempdir().unwrap();
    let item = DownloadItem {
        uid: Uuid::new_v4(),
        file_name: "pattern.bin".into(),
        file_path: PathBuf::new(),
        download_url: String::new(),
        content_length: CONTENT_LENGTH,
        status: TransferStatus::Pending,
        finish_date: None,
    };
    let settings = DownloadSettings {
        base_temp_dir: temp.path().to_path_buf(),
        base_save_dir: temp.path().to_path_buf(),
        temp_file_flush_bytes: 64_000,
        ..DownloadSettings::default()
    };
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(256);

    let worker = ConnectionWorker::new(
        item.clone(),
        settings.clone(),
        Arc::new(PatternSource { chunk, delay }),
        0,
        command_rx,
        event_tx,
    );
    tokio::spawn(worker.run());

    Harness {
        command_tx,
        event_rx,
        item,
        settings,
        _temp: temp,
    }
}

impl Harness {
    async fn send(&self, command: Command, segment: Option<Segment>) {
        let mut cmd = DownloadCommand::new(command, self.item.clone(), self.settings.clone());
        cmd.segment = segment;
        cmd.connection_number = Some(0);
        self.command_tx.send(cmd).await.unwrap();
    }

    async fn next_event(&mut self) -> WorkerMessage {
        let (_, msg) = timeout(Duration::from_secs(10), self.event_rx.recv())
            .await
            .expect("timed out waiting for worker message")
            .expect("worker channel closed");
        msg
    }

    async fn expect_handshake(&mut self) {
        loop {
            if let WorkerMessage::Handshake(h) = self.next_event().await {
                assert_eq!(h.new_connection_number, 0);
                return;
            }
        }
    }

    async fn expect_segment_message(&mut self) -> rapidget_engine::engine::messages::ConnectionSegmentMessage {
        loop {
            if let WorkerMessage::Segment(m) = self.next_event().await {
                return m;
            }
        }
    }

    async fn expect_completion(&mut self) {
        loop {
            if let WorkerMessage::Progress(p) = self.next_event().await {
                if p.completion_signal {
                    assert_eq!(p.details_status, TransferStatus::ConnectionComplete);
                    assert!(p.total_connection_write_progress >= 1.0);
                    return;
                }
            }
        }
    }

    fn store(&self) -> TempFileStore {
        TempFileStore::new(&self.settings.base_temp_dir, &self.item.uid.to_string())
    }
}

#[tokio::test]
async fn test_refresh_before_split_point_succeeds() {
    let mut h = start_worker(50_000, Duration::from_millis(40));
    let whole = Segment::new(0, CONTENT_LENGTH - 1);
    h.send(Command::StartInitial, Some(whole)).await;
    h.expect_handshake().await;

    // Only a chunk or two can have arrived; the split point is far ahead.
    let proposed = Segment::new(0, 499_999);
    h.send(Command::RefreshSegment, Some(proposed)).await;

    let reply = h.expect_segment_message().await;
    assert_eq!(reply.internal, InternalSegmentMessage::RefreshSegmentSuccess);
    assert_eq!(reply.requested_segment, proposed);
    assert!(!reply.reuse_connection);

    // The worker now stops at the shrunk boundary.
    h.expect_completion().await;
    let missing = h.store().find_missing_byte_ranges(CONTENT_LENGTH).unwrap();
    assert_eq!(missing, vec![Segment::new(500_000, CONTENT_LENGTH - 1)]);
}

#[tokio::test]
async fn test_refresh_past_split_point_renegotiates() {
    let mut h = start_worker(100_000, Duration::from_millis(15));
    let whole = Segment::new(0, CONTENT_LENGTH - 1);
    h.send(Command::StartInitial, Some(whole)).await;
    h.expect_handshake().await;

    // Let the worker run well past the midpoint before proposing it.
    tokio::time::sleep(Duration::from_millis(130)).await;
    let proposed = Segment::new(0, 499_999);
    h.send(Command::RefreshSegment, Some(proposed)).await;

    let reply = h.expect_segment_message().await;
    assert_eq!(
        reply.internal,
        InternalSegmentMessage::OverlappingRefreshSegment
    );
    let refreshed_end = reply.refreshed_end_byte.unwrap();
    let valid_start = reply.valid_new_start_byte.unwrap();
    // The corrected boundary sits at or past the proposal, and the handover
    // range picks up exactly one byte later: nothing is downloaded twice.
    assert!(refreshed_end >= proposed.end);
    assert_eq!(valid_start, refreshed_end + 1);
    assert_eq!(reply.valid_new_end_byte.unwrap(), CONTENT_LENGTH - 1);

    h.expect_completion().await;
    let missing = h.store().find_missing_byte_ranges(CONTENT_LENGTH).unwrap();
    assert_eq!(missing, vec![Segment::new(valid_start, CONTENT_LENGTH - 1)]);
}

#[tokio::test]
async fn test_refresh_after_completion_is_refused() {
    let mut h = start_worker(250_000, Duration::from_millis(1));
    let whole = Segment::new(0, CONTENT_LENGTH - 1);
    h.send(Command::StartInitial, Some(whole)).await;
    h.expect_handshake().await;
    h.expect_completion().await;

    h.send(
        Command::RefreshSegmentReuseConnection,
        Some(Segment::new(0, 499_999)),
    )
    .await;
    let reply = h.expect_segment_message().await;
    assert_eq!(
        reply.internal,
        InternalSegmentMessage::ReuseConnectionRefreshSegmentRefused
    );
    assert!(reply.reuse_connection);
}

#[tokio::test]
async fn test_pause_stops_traffic_and_resume_completes() {
    let mut h = start_worker(50_000, Duration::from_millis(30));
    let whole = Segment::new(0, CONTENT_LENGTH - 1);
    h.send(Command::StartInitial, Some(whole)).await;
    h.expect_handshake().await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    h.send(Command::Pause, None).await;

    // Wait for the paused report and note how far the worker got.
    let paused_bytes = loop {
        if let WorkerMessage::Progress(p) = h.next_event().await {
            if p.details_status == TransferStatus::Paused {
                assert!(p.button_availability.start);
                assert!(!p.button_availability.pause);
                break p.total_received_bytes;
            }
        }
    };
    assert!(paused_bytes < CONTENT_LENGTH);

    // Paused workers stay quiet.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut drained = 0;
    while let Ok(event) = h.event_rx.try_recv() {
        if let WorkerMessage::Progress(p) = event.1 {
            assert_eq!(p.details_status, TransferStatus::Paused);
        }
        drained += 1;
    }
    assert!(drained <= 1);

    h.send(Command::Start, None).await;
    h.expect_completion().await;
    let missing = h.store().find_missing_byte_ranges(CONTENT_LENGTH).unwrap();
    assert!(missing.is_empty());
}

#[tokio::test]
async fn test_reuse_start_reports_reuse_handshake() {
    let mut h = start_worker(250_000, Duration::from_millis(1));
    let first = Segment::new(0, 499_999);
    h.send(Command::StartInitial, Some(first)).await;
    h.expect_handshake().await;
    h.expect_completion().await;

    let second = Segment::new(500_000, CONTENT_LENGTH - 1);
    h.send(Command::StartReuseConnection, Some(second)).await;
    loop {
        if let WorkerMessage::Handshake(hs) = h.next_event().await {
            assert!(hs.reuse_connection);
            break;
        }
    }
    h.expect_completion().await;
    let missing = h.store().find_missing_byte_ranges(CONTENT_LENGTH).unwrap();
    assert!(missing.is_empty());
}
