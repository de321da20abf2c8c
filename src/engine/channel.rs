// Per-download coordinator state — one `EngineChannel` per live download,
// holding the segment tree, the worker handles, and the bookkeeping the
// periodic timers act on. Owned exclusively by the coordinator task.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{DownloadSettings, LOG_BUFFER_LINES};
use crate::engine::messages::{
    ButtonAvailability, ConnectionProgress, DownloadCommand, DownloadItem, TransferStatus,
};
use crate::engine::progress::{ButtonDebounce, EtaState};
use crate::segment::tree::SegmentTree;
use crate::segment::Segment;
use crate::source::DownloadSource;
use crate::store::TempFileStore;

/// Command channel to one worker plus the coordinator's last-known mirror of
/// its state.
#[derive(Debug)]
pub struct WorkerHandle {
    pub connection_number: u32,
    pub sender: mpsc::Sender<DownloadCommand>,
    pub segment: Segment,
    pub status: TransferStatus,
    pub details_status: TransferStatus,
    pub reset_count: u32,
    pub last_response_millis: u64,
    pub awaiting_reset_response: bool,
    pub button_availability: ButtonAvailability,
}

impl WorkerHandle {
    pub fn new(
        connection_number: u32,
        sender: mpsc::Sender<DownloadCommand>,
        segment: Segment,
        now_millis: u64,
    ) -> Self {
        Self {
            connection_number,
            sender,
            segment,
            status: TransferStatus::Connecting,
            details_status: TransferStatus::Connecting,
            reset_count: 0,
            last_response_millis: now_millis,
            awaiting_reset_response: false,
            button_availability: ButtonAvailability::default(),
        }
    }

    /// Fire-and-forget send; a full or closed worker channel is the worker's
    /// problem to recover from, not the coordinator's.
    pub fn send(&self, command: DownloadCommand) {
        if let Err(e) = self.sender.try_send(command) {
            debug!(
                "dropping command to connection {}: {}",
                self.connection_number, e
            );
        }
    }
}

/// Everything the coordinator tracks for one download.
pub struct EngineChannel {
    pub item: DownloadItem,
    pub settings: DownloadSettings,
    pub source: Arc<dyn DownloadSource>,
    pub store: TempFileStore,
    pub tree: SegmentTree,
    pub workers: HashMap<u32, WorkerHandle>,
    pub pending_handshakes: HashSet<u32>,
    /// Connections that finished their segment and wait to be recycled.
    pub reuse_queue: VecDeque<u32>,
    pub created_connections: u32,
    pub paused: bool,
    pub pause_on_final_handshake: bool,
    pub assemble_requested: bool,
    /// Set by `pause`; cleared by `start`. Suppresses the dynamic spawner.
    pub spawn_ignored: bool,
    /// Latched after a tree invariant violation; spawn and reuse stand down.
    pub tree_faulted: bool,
    /// Latest progress per connection number, kept in connection order.
    pub connection_progresses: BTreeMap<u32, ConnectionProgress>,
    /// Bytes already on disk when this download (re)started; missing-range
    /// leaves cover the rest.
    pub initially_covered_bytes: u64,
    pub eta: EtaState,
    pub buttons: ButtonDebounce,
    logs: VecDeque<String>,
}

impl EngineChannel {
    pub fn new(
        item: DownloadItem,
        settings: DownloadSettings,
        source: Arc<dyn DownloadSource>,
        store: TempFileStore,
        tree: SegmentTree,
        initially_covered_bytes: u64,
        now_millis: u64,
    ) -> Self {
        Self {
            item,
            settings,
            source,
            store,
            tree,
            workers: HashMap::new(),
            pending_handshakes: HashSet::new(),
            reuse_queue: VecDeque::new(),
            created_connections: 0,
            paused: false,
            pause_on_final_handshake: false,
            assemble_requested: false,
            spawn_ignored: false,
            tree_faulted: false,
            connection_progresses: BTreeMap::new(),
            initially_covered_bytes,
            eta: EtaState::default(),
            buttons: ButtonDebounce::new(now_millis),
            logs: VecDeque::new(),
        }
    }

    pub fn uid(&self) -> uuid::Uuid {
        self.item.uid
    }

    /// The worker currently serving exactly `segment`, if any.
    pub fn worker_for_segment(&self, segment: &Segment) -> Option<&WorkerHandle> {
        self.workers.values().find(|w| w.segment == *segment)
    }

    /// Enqueue a finished connection for recycling. Deduplicates.
    pub fn enqueue_reuse(&mut self, connection_number: u32) {
        if !self.reuse_queue.contains(&connection_number) {
            self.reuse_queue.push_back(connection_number);
        }
    }

    pub fn any_awaiting_reset(&self) -> bool {
        self.workers.values().any(|w| w.awaiting_reset_response)
    }

    /// Overall received fraction: recovery-covered bytes plus each
    /// connection's share. Summed in bytes so a finished download reads
    /// exactly 1.0.
    pub fn total_progress(&self) -> f64 {
        if self.item.content_length == 0 {
            return 0.0;
        }
        let received: u64 = self
            .connection_progresses
            .values()
            .map(|p| p.total_received_bytes)
            .sum();
        let covered = (self.initially_covered_bytes + received).min(self.item.content_length);
        covered as f64 / self.item.content_length as f64
    }

    /// Fraction of the bytes assigned this session.
    pub fn session_progress(&self) -> f64 {
        let total_bytes = self.item.content_length;
        let session_bytes = total_bytes.saturating_sub(self.initially_covered_bytes);
        if session_bytes == 0 {
            return 1.0;
        }
        let received = (self.total_progress() * total_bytes as f64)
            - self.initially_covered_bytes as f64;
        (received / session_bytes as f64).clamp(0.0, 1.0)
    }

    /// Whether every connection has flushed its assignment and the temp
    /// directory has no gaps left.
    pub fn temp_writes_complete(&self) -> bool {
        if self.connection_progresses.is_empty() {
            return false;
        }
        let all_flushed = self.connection_progresses.values().all(|p| {
            p.total_connection_write_progress >= 1.0
                && p.details_status == TransferStatus::ConnectionComplete
        });
        if !all_flushed {
            return false;
        }
        matches!(
            self.store.find_missing_byte_ranges(self.item.content_length),
            Ok(ranges) if ranges.is_empty()
        )
    }

    pub fn push_log(&mut self, line: String) {
        if self.logs.len() == LOG_BUFFER_LINES {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    pub fn logs(&self) -> impl Iterator<Item = &str> {
        self.logs.iter().map(|s| s.as_str())
    }
}
