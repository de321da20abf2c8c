use std::path::PathBuf;

use serde::Deserialize;

/// Smallest segment a split may hand to a new connection (500 KB).
/// A split is refused when the resulting right child would be shorter.
pub const MINIMUM_DOWNLOAD_SEGMENT_LENGTH: u64 = 500_000;

/// Period of the dynamic connection-spawn timer.
pub const SPAWN_TIMER_PERIOD_MILLIS: u64 = 2_000;

/// Period of the connection-reuse timer.
pub const REUSE_TIMER_PERIOD_MILLIS: u64 = 2_000;

/// Period of the stalled-connection reset timer.
pub const RESET_TIMER_PERIOD_MILLIS: u64 = 4_000;

/// Period of the button-availability notification timer.
pub const BUTTON_NOTIFY_PERIOD_MILLIS: u64 = 1_000;

/// Debounce applied before pause/start buttons may be reported enabled (2 s).
pub const BUTTON_AVAILABILITY_WAIT_MILLIS: u64 = 2_000;

/// Timeout for the HEAD request used to probe a download source.
pub const PROBE_TIMEOUT_SECS: u64 = 10;

/// A download whose ETA drops below this is "near completion" — no new
/// connections are spawned for it.
pub const NEAR_COMPLETION_ETA_SECS: u64 = 5;

/// Buffered bytes a worker accumulates before flushing a temp file (2 MB).
pub const DEFAULT_TEMP_FILE_FLUSH_BYTES: u64 = 2 * 1024 * 1024;

/// Lines retained in a download's in-memory log ring.
pub const LOG_BUFFER_LINES: usize = 512;

/// Top-level configuration for one download.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSettings {
    /// Target number of parallel connections.
    pub total_connections: u32,
    /// Resets allowed per connection before it is left alone. `-1` = infinite.
    pub max_connection_retry_count: i32,
    /// Worker silence tolerated before a reset is issued.
    pub connection_retry_timeout_millis: u64,
    /// Directory holding per-download temp subdirectories.
    pub base_temp_dir: PathBuf,
    /// Directory receiving assembled files.
    pub base_save_dir: PathBuf,
    /// Buffered bytes before a worker flushes a temp file.
    pub temp_file_flush_bytes: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            total_connections: 4,
            max_connection_retry_count: 10,
            connection_retry_timeout_millis: 15_000,
            base_temp_dir: PathBuf::new(),
            base_save_dir: PathBuf::new(),
            temp_file_flush_bytes: DEFAULT_TEMP_FILE_FLUSH_BYTES,
        }
    }
}
