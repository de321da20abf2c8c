// Connection worker — the per-connection execution unit. Receives commands on
// its own channel, pulls its byte range from the source as a stream, flushes
// ranges to temp files, and negotiates segment refreshes with the
// coordinator. Failures are reported, never propagated: the task stays alive
// so a reset command remains deliverable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DownloadSettings;
use crate::engine::messages::{
    ButtonAvailability, Command, ConnectionHandshake, ConnectionProgress,
    ConnectionSegmentMessage, DownloadCommand, DownloadItem, InternalSegmentMessage, LogMessage,
    TransferStatus, WorkerMessage,
};
use crate::error::EngineError;
use crate::segment::Segment;
use crate::source::{ByteStream, DownloadSource};
use crate::store::{temp_file_name, TempFileStore};

/// Local fetch retries before the worker goes idle and waits for a reset.
const MAX_LOCAL_RETRIES: u32 = 3;

/// Minimum interval between routine progress emissions.
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Sliding-window transfer-rate estimate, sampled once per second.
#[derive(Debug)]
pub struct RateTracker {
    window_start: Instant,
    window_bytes: u64,
    rate: f64,
}

impl RateTracker {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            rate: 0.0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.window_bytes += bytes;
    }

    pub fn current_rate(&mut self) -> f64 {
        let elapsed = self.window_start.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            self.rate = self.window_bytes as f64 / elapsed;
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
        self.rate
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new()
    }
}

enum Event {
    Command(Option<DownloadCommand>),
    Chunk(Option<Result<Bytes, EngineError>>),
}

pub struct ConnectionWorker {
    item: DownloadItem,
    settings: DownloadSettings,
    source: Arc<dyn DownloadSource>,
    store: TempFileStore,
    command_rx: mpsc::Receiver<DownloadCommand>,
    event_tx: mpsc::Sender<(Uuid, WorkerMessage)>,
    connection_number: u32,
    segment: Option<Segment>,
    /// Next byte to receive.
    position: u64,
    buffer: Vec<u8>,
    /// Byte offset of `buffer[0]`.
    buffer_start: u64,
    /// Bytes flushed to temp files for the current assignment.
    flushed_bytes: u64,
    /// Length of the current assignment.
    assigned_bytes: u64,
    /// Bytes this connection number has received over its lifetime, including
    /// the credit for ranges completed in earlier runs.
    received_lifetime: u64,
    status: TransferStatus,
    paused: bool,
    completion_sent: bool,
    /// Set once per assignment; consumed by the next progress emission.
    pending_completion_signal: bool,
    stream: Option<ByteStream>,
    retry_attempts: u32,
    rate: RateTracker,
    last_emit: Instant,
}

impl ConnectionWorker {
    pub fn new(
        item: DownloadItem,
        settings: DownloadSettings,
        source: Arc<dyn DownloadSource>,
        connection_number: u32,
        command_rx: mpsc::Receiver<DownloadCommand>,
        event_tx: mpsc::Sender<(Uuid, WorkerMessage)>,
    ) -> Self {
        let store = TempFileStore::new(&settings.base_temp_dir, &item.uid.to_string());
        Self {
            item,
            settings,
            source,
            store,
            command_rx,
            event_tx,
            connection_number,
            segment: None,
            position: 0,
            buffer: Vec::new(),
            buffer_start: 0,
            flushed_bytes: 0,
            assigned_bytes: 0,
            received_lifetime: 0,
            status: TransferStatus::Pending,
            paused: false,
            completion_sent: false,
            pending_completion_signal: false,
            stream: None,
            retry_attempts: 0,
            rate: RateTracker::new(),
            last_emit: Instant::now() - PROGRESS_EMIT_INTERVAL,
        }
    }

    pub async fn run(mut self) {
        loop {
            let event = if self.stream.is_some() {
                let Self {
                    command_rx, stream, ..
                } = &mut self;
                let stream = stream.as_mut().expect("stream checked above");
                tokio::select! {
                    cmd = command_rx.recv() => Event::Command(cmd),
                    chunk = stream.next() => Event::Chunk(chunk),
                }
            } else {
                Event::Command(self.command_rx.recv().await)
            };

            match event {
                // Coordinator dropped the channel: the download is gone.
                Event::Command(None) => break,
                Event::Command(Some(cmd)) => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Event::Chunk(Some(Ok(bytes))) => self.on_chunk(bytes).await,
                Event::Chunk(Some(Err(e))) => self.on_stream_error(e).await,
                Event::Chunk(None) => self.on_stream_end().await,
            }
        }
        debug!("connection {} worker exiting", self.connection_number);
    }

    /// Returns `true` when the worker should exit.
    async fn handle_command(&mut self, cmd: DownloadCommand) -> bool {
        match cmd.command {
            Command::StartInitial => {
                if let Some(conn) = cmd.connection_number {
                    self.connection_number = conn;
                }
                let Some(segment) = cmd.segment else {
                    self.log("start command carried no segment").await;
                    return false;
                };
                self.received_lifetime = cmd.previously_written_byte_length;
                self.adopt_assignment(segment);
                self.send_handshake(false).await;
                self.begin(segment.start).await;
            }
            Command::StartReuseConnection => {
                if let Some(conn) = cmd.connection_number {
                    self.connection_number = conn;
                }
                let Some(segment) = cmd.segment else {
                    self.log("reuse command carried no segment").await;
                    return false;
                };
                self.adopt_assignment(segment);
                self.send_handshake(true).await;
                self.begin(segment.start).await;
            }
            Command::Start => {
                if self.paused {
                    self.paused = false;
                    if !self.completion_sent && self.segment.is_some() {
                        self.begin(self.position).await;
                    } else {
                        self.emit_progress(true).await;
                    }
                }
            }
            Command::Pause => {
                self.paused = true;
                self.stream = None;
                self.flush_buffer().await;
                if !self.completion_sent {
                    self.status = TransferStatus::Paused;
                }
                self.emit_progress(true).await;
            }
            Command::Cancel => {
                self.stream = None;
                self.flush_buffer().await;
                self.status = TransferStatus::Canceled;
                self.emit_progress(true).await;
                return true;
            }
            Command::ResetConnection => {
                self.retry_attempts = 0;
                if !self.completion_sent && !self.paused && self.segment.is_some() {
                    self.stream = None;
                    self.begin(self.position).await;
                } else {
                    self.emit_progress(true).await;
                }
            }
            Command::RefreshSegment => {
                let Some(proposed) = cmd.segment else { return false };
                self.handle_refresh(proposed, false).await;
            }
            Command::RefreshSegmentReuseConnection => {
                let Some(proposed) = cmd.segment else { return false };
                self.handle_refresh(proposed, true).await;
            }
        }
        false
    }

    fn adopt_assignment(&mut self, segment: Segment) {
        self.segment = Some(segment);
        self.position = segment.start;
        self.buffer.clear();
        self.buffer_start = segment.start;
        self.flushed_bytes = 0;
        self.assigned_bytes = segment.length();
        self.completion_sent = false;
        self.pending_completion_signal = false;
        self.paused = false;
        self.retry_attempts = 0;
    }

    fn refusal_message(&self, proposed: Segment, reuse: bool) -> ConnectionSegmentMessage {
        ConnectionSegmentMessage {
            connection_number: self.connection_number,
            internal: if reuse {
                InternalSegmentMessage::ReuseConnectionRefreshSegmentRefused
            } else {
                InternalSegmentMessage::RefreshSegmentRefused
            },
            requested_segment: proposed,
            refreshed_start_byte: None,
            refreshed_end_byte: None,
            valid_new_start_byte: None,
            valid_new_end_byte: None,
            reuse_connection: reuse,
        }
    }

    /// Negotiate a shrink of the current segment to `proposed`.
    async fn handle_refresh(&mut self, proposed: Segment, reuse: bool) {
        let Some(current) = self.segment else {
            let refusal = self.refusal_message(proposed, reuse);
            self.send_segment_message(refusal).await;
            return;
        };
        // Nothing left to hand over once the segment is fully received.
        if self.completion_sent || self.position > current.end {
            let refusal = self.refusal_message(proposed, reuse);
            self.send_segment_message(refusal).await;
            return;
        }

        if self.position <= proposed.end {
            // The split point is still ahead: shrink to the proposed range and
            // keep downloading toward its end.
            self.segment = Some(proposed);
            self.assigned_bytes = proposed.length();
            self.stream = None;
            self.send_segment_message(ConnectionSegmentMessage {
                connection_number: self.connection_number,
                internal: InternalSegmentMessage::RefreshSegmentSuccess,
                requested_segment: proposed,
                refreshed_start_byte: None,
                refreshed_end_byte: None,
                valid_new_start_byte: None,
                valid_new_end_byte: None,
                reuse_connection: reuse,
            })
            .await;
            if !self.paused {
                self.begin(self.position).await;
            }
        } else {
            // Already written past the proposed boundary: renegotiate so the
            // handover starts at the current position and nothing is fetched
            // twice.
            let corrected = Segment::new(current.start, self.position - 1);
            self.segment = Some(corrected);
            self.assigned_bytes = corrected.length();
            self.stream = None;
            self.send_segment_message(ConnectionSegmentMessage {
                connection_number: self.connection_number,
                internal: InternalSegmentMessage::OverlappingRefreshSegment,
                requested_segment: proposed,
                refreshed_start_byte: Some(corrected.start),
                refreshed_end_byte: Some(corrected.end),
                valid_new_start_byte: Some(self.position),
                valid_new_end_byte: Some(current.end),
                reuse_connection: reuse,
            })
            .await;
            self.complete_assignment().await;
        }
    }

    /// Open the byte stream for `[from, segment.end]`.
    async fn begin(&mut self, from: u64) {
        let Some(segment) = self.segment else { return };
        if from > segment.end {
            self.complete_assignment().await;
            return;
        }
        self.position = from;
        if self.buffer.is_empty() {
            self.buffer_start = from;
        }
        self.status = TransferStatus::Connecting;
        match self
            .source
            .fetch_range(Segment::new(from, segment.end))
            .await
        {
            Ok(stream) => {
                self.stream = Some(stream);
                self.emit_progress(true).await;
            }
            Err(e) => self.on_stream_error(e).await,
        }
    }

    async fn on_chunk(&mut self, bytes: Bytes) {
        let Some(segment) = self.segment else { return };
        if bytes.is_empty() {
            return;
        }
        self.status = TransferStatus::Downloading;
        self.retry_attempts = 0;

        // Clamp anything the server sends past the segment end.
        let room = (segment.end + 1).saturating_sub(self.position);
        let take = (bytes.len() as u64).min(room) as usize;
        if take == 0 {
            self.stream = None;
            self.complete_assignment().await;
            return;
        }
        self.buffer.extend_from_slice(&bytes[..take]);
        self.position += take as u64;
        self.received_lifetime += take as u64;
        self.rate.record(take as u64);

        if self.buffer.len() as u64 >= self.settings.temp_file_flush_bytes {
            self.flush_buffer().await;
        }

        if self.position > segment.end {
            self.stream = None;
            self.complete_assignment().await;
        } else {
            self.emit_progress(false).await;
        }
    }

    async fn on_stream_end(&mut self) {
        self.stream = None;
        match self.segment {
            Some(segment) if self.position > segment.end => self.complete_assignment().await,
            Some(_) => self.retry("response ended before the segment did").await,
            None => {}
        }
    }

    async fn on_stream_error(&mut self, error: EngineError) {
        self.stream = None;
        self.retry(&format!("fetch failed: {}", error)).await;
    }

    /// Bounded local retry with backoff; afterwards go idle and wait for the
    /// coordinator's reset.
    async fn retry(&mut self, reason: &str) {
        self.retry_attempts += 1;
        if self.retry_attempts <= MAX_LOCAL_RETRIES {
            self.log(&format!(
                "connection {}: {} (attempt {})",
                self.connection_number, reason, self.retry_attempts
            ))
            .await;
            tokio::time::sleep(Duration::from_millis(500 * self.retry_attempts as u64)).await;
            if !self.paused {
                Box::pin(self.begin(self.position)).await;
            }
        } else {
            warn!(
                "connection {} giving up after {} local retries: {}",
                self.connection_number, MAX_LOCAL_RETRIES, reason
            );
            self.status = TransferStatus::Failed;
            self.emit_progress(true).await;
        }
    }

    /// Write the buffered range out as one immutable temp file.
    async fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let len = self.buffer.len() as u64;
        let range = Segment::new(self.buffer_start, self.buffer_start + len - 1);
        let path = self.store.dir().join(temp_file_name(&range));

        let result = async {
            tokio::fs::create_dir_all(self.store.dir()).await?;
            tokio::fs::write(&path, &self.buffer).await
        }
        .await;

        match result {
            Ok(()) => {
                self.flushed_bytes += len;
                self.buffer_start = self.position;
                self.buffer.clear();
            }
            Err(e) => {
                warn!("connection {} flush to {:?} failed: {}", self.connection_number, path, e);
                self.log(&format!("temp file write failed: {}", e)).await;
            }
        }
    }

    async fn complete_assignment(&mut self) {
        self.stream = None;
        self.flush_buffer().await;
        if self.completion_sent {
            return;
        }
        self.completion_sent = true;
        self.pending_completion_signal = true;
        self.status = TransferStatus::ConnectionComplete;
        self.emit_progress(true).await;
    }

    async fn send_handshake(&mut self, reuse: bool) {
        let message = WorkerMessage::Handshake(ConnectionHandshake {
            new_connection_number: self.connection_number,
            reuse_connection: reuse,
        });
        self.send(message).await;
    }

    async fn send_segment_message(&mut self, message: ConnectionSegmentMessage) {
        self.send(WorkerMessage::Segment(message)).await;
    }

    async fn log(&mut self, line: &str) {
        debug!("{}", line);
        let message = WorkerMessage::Log(LogMessage {
            connection_number: self.connection_number,
            log: line.to_string(),
        });
        self.send(message).await;
    }

    async fn emit_progress(&mut self, force: bool) {
        if !force && self.last_emit.elapsed() < PROGRESS_EMIT_INTERVAL {
            return;
        }
        self.last_emit = Instant::now();

        let segment = self.segment;
        let download_progress = segment
            .map(|s| (self.position - s.start) as f64 / s.length() as f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let total_download_progress = if self.item.content_length > 0 {
            (self.received_lifetime as f64 / self.item.content_length as f64).min(1.0)
        } else {
            0.0
        };
        let write_progress = if self.assigned_bytes == 0 {
            1.0
        } else {
            (self.flushed_bytes as f64 / self.assigned_bytes as f64).min(1.0)
        };

        let progress = ConnectionProgress {
            connection_number: self.connection_number,
            status: self.status,
            details_status: self.status,
            download_progress,
            total_download_progress,
            total_connection_write_progress: write_progress,
            total_received_bytes: self.received_lifetime,
            bytes_transfer_rate: self.rate.current_rate(),
            button_availability: ButtonAvailability {
                pause: !self.paused && !self.completion_sent,
                start: self.paused,
            },
            completion_signal: std::mem::take(&mut self.pending_completion_signal),
            segment,
        };
        self.send(WorkerMessage::Progress(progress)).await;
    }

    async fn send(&mut self, message: WorkerMessage) {
        if self.event_tx.send((self.item.uid, message)).await.is_err() {
            // Coordinator is gone; close our command side so run() exits.
            self.command_rx.close();
        }
    }
}
