// Message vocabulary of the engine — commands in, aggregated progress out,
// and the worker-side message types in between. Worker→coordinator traffic is
// a tagged enum so dispatch is an exhaustive match.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DownloadSettings;
use crate::segment::Segment;

/// Coarse transfer state, shared by downloads and individual connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Connecting,
    Downloading,
    Paused,
    Canceled,
    Failed,
    ConnectionComplete,
    AssembleComplete,
    AssembleFailed,
}

impl TransferStatus {
    /// Whether a connection in this state has finished its assigned work for
    /// good (no resets, no further traffic expected).
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TransferStatus::Paused | TransferStatus::Canceled | TransferStatus::ConnectionComplete
        )
    }
}

/// One download, as known to callers and workers alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    pub uid: Uuid,
    pub file_name: String,
    /// Destination path of the assembled artifact.
    pub file_path: PathBuf,
    pub download_url: String,
    pub content_length: u64,
    pub status: TransferStatus,
    pub finish_date: Option<DateTime<Utc>>,
}

/// Verbs accepted on the engine's inbound channel and forwarded to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Pause,
    Cancel,
    RefreshSegment,
    RefreshSegmentReuseConnection,
    ResetConnection,
    StartInitial,
    StartReuseConnection,
}

/// A command addressed to the engine (or, with `connection_number` filled in,
/// to one of its workers).
#[derive(Debug, Clone)]
pub struct DownloadCommand {
    pub command: Command,
    pub item: DownloadItem,
    pub settings: DownloadSettings,
    pub segment: Option<Segment>,
    pub connection_number: Option<u32>,
    pub previously_written_byte_length: u64,
}

impl DownloadCommand {
    pub fn new(command: Command, item: DownloadItem, settings: DownloadSettings) -> Self {
        Self {
            command,
            item,
            settings,
            segment: None,
            connection_number: None,
            previously_written_byte_length: 0,
        }
    }
}

/// UI hints for the pause/start buttons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonAvailability {
    pub pause: bool,
    pub start: bool,
}

/// A worker's periodic progress report.
#[derive(Debug, Clone)]
pub struct ConnectionProgress {
    pub connection_number: u32,
    pub status: TransferStatus,
    pub details_status: TransferStatus,
    /// Fraction of the current segment received.
    pub download_progress: f64,
    /// Fraction of the whole content this connection has received, including
    /// bytes credited from earlier runs.
    pub total_download_progress: f64,
    /// Fraction of this connection's assignment flushed to temp files.
    pub total_connection_write_progress: f64,
    pub total_received_bytes: u64,
    pub bytes_transfer_rate: f64,
    pub button_availability: ButtonAvailability,
    /// Single-shot marker: every byte of the segment is on disk.
    pub completion_signal: bool,
    pub segment: Option<Segment>,
}

/// Outcome of a segment-refresh negotiation, from the worker's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalSegmentMessage {
    RefreshSegmentSuccess,
    OverlappingRefreshSegment,
    RefreshSegmentRefused,
    ReuseConnectionRefreshSegmentRefused,
}

/// A worker's reply to `RefreshSegment` / `RefreshSegmentReuseConnection`.
#[derive(Debug, Clone)]
pub struct ConnectionSegmentMessage {
    pub connection_number: u32,
    pub internal: InternalSegmentMessage,
    /// The segment the refresh command proposed; correlates the reply with a
    /// tree leaf.
    pub requested_segment: Segment,
    pub refreshed_start_byte: Option<u64>,
    pub refreshed_end_byte: Option<u64>,
    pub valid_new_start_byte: Option<u64>,
    pub valid_new_end_byte: Option<u64>,
    pub reuse_connection: bool,
}

/// A newly started (or recycled) worker announcing it is live.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionHandshake {
    pub new_connection_number: u32,
    pub reuse_connection: bool,
}

#[derive(Debug, Clone)]
pub struct LogMessage {
    pub connection_number: u32,
    pub log: String,
}

/// Everything a worker can tell the coordinator.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Progress(ConnectionProgress),
    Segment(ConnectionSegmentMessage),
    Handshake(ConnectionHandshake),
    Log(LogMessage),
}

/// The engine's aggregated, caller-facing progress event.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub item: DownloadItem,
    pub status: TransferStatus,
    /// Fraction of this session's assigned bytes received.
    pub download_progress: f64,
    /// Fraction of the whole content on disk or in flight.
    pub total_download_progress: f64,
    pub transfer_rate: String,
    pub estimated_remaining: String,
    pub button_availability: ButtonAvailability,
    pub connection_progresses: Vec<ConnectionProgress>,
    pub assemble_progress: Option<f64>,
}
