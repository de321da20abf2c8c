// Progress aggregation helpers — transfer-rate and ETA formatting, status
// precedence, and button-availability debouncing. Everything takes the clock
// as an argument so tests stay deterministic.

use crate::config::BUTTON_AVAILABILITY_WAIT_MILLIS;
use crate::engine::messages::{ButtonAvailability, ConnectionProgress, TransferStatus};

/// Render seconds as `"D Days, H Hours, M Minutes, S Seconds"`, dropping
/// leading zero-valued components.
pub fn format_duration(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut parts: Vec<String> = Vec::with_capacity(4);
    if days > 0 {
        parts.push(format!("{} Days", days));
    }
    if hours > 0 || !parts.is_empty() {
        parts.push(format!("{} Hours", hours));
    }
    if minutes > 0 || !parts.is_empty() {
        parts.push(format!("{} Minutes", minutes));
    }
    parts.push(format!("{} Seconds", seconds));
    parts.join(", ")
}

/// Render a byte rate as e.g. `"1.25 MB/s"`.
pub fn format_transfer_rate(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    if bytes_per_sec >= GB {
        format!("{:.2} GB/s", bytes_per_sec / GB)
    } else if bytes_per_sec >= MB {
        format!("{:.2} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.2} KB/s", bytes_per_sec / KB)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

/// Whole seconds until the remaining bytes arrive at the current rate.
/// `None` when the rate is zero (stalled) or the download is complete.
pub fn eta_seconds(content_length: u64, total_progress: f64, rate_bytes_per_sec: f64) -> Option<u64> {
    if total_progress >= 1.0 {
        return Some(0);
    }
    if rate_bytes_per_sec <= 0.0 {
        return None;
    }
    let remaining = (content_length as f64) * (1.0 - total_progress);
    Some((remaining / rate_bytes_per_sec).ceil() as u64)
}

/// ETA recomputation throttle plus the last rendered value.
#[derive(Debug, Default)]
pub struct EtaState {
    last_computed_millis: Option<u64>,
    pub text: String,
    pub seconds: Option<u64>,
}

impl EtaState {
    /// Recompute at most once per second; otherwise the previous rendering is
    /// kept.
    pub fn update(
        &mut self,
        now_millis: u64,
        content_length: u64,
        total_progress: f64,
        rate_bytes_per_sec: f64,
    ) {
        if let Some(last) = self.last_computed_millis {
            if now_millis.saturating_sub(last) < 1_000 && total_progress < 1.0 {
                return;
            }
        }
        self.last_computed_millis = Some(now_millis);
        if total_progress >= 1.0 {
            self.seconds = Some(0);
            self.text = String::new();
            return;
        }
        self.seconds = eta_seconds(content_length, total_progress, rate_bytes_per_sec);
        self.text = match self.seconds {
            Some(secs) => format_duration(secs),
            None => String::new(),
        };
    }
}

/// Per-engine debounce anchors for the pause/start buttons. The pause anchor
/// resets when downloading (re)starts, the start anchor when the download is
/// paused; a button reads enabled only `BUTTON_AVAILABILITY_WAIT_MILLIS`
/// after its anchor.
#[derive(Debug)]
pub struct ButtonDebounce {
    pause_anchor_millis: u64,
    start_anchor_millis: u64,
}

impl ButtonDebounce {
    pub fn new(now_millis: u64) -> Self {
        Self {
            pause_anchor_millis: now_millis,
            start_anchor_millis: now_millis,
        }
    }

    pub fn reset_pause_wait(&mut self, now_millis: u64) {
        self.pause_anchor_millis = now_millis;
    }

    pub fn reset_start_wait(&mut self, now_millis: u64) {
        self.start_anchor_millis = now_millis;
    }

    pub fn pause_wait_complete(&self, now_millis: u64) -> bool {
        now_millis.saturating_sub(self.pause_anchor_millis) >= BUTTON_AVAILABILITY_WAIT_MILLIS
    }

    pub fn start_wait_complete(&self, now_millis: u64) -> bool {
        now_millis.saturating_sub(self.start_anchor_millis) >= BUTTON_AVAILABILITY_WAIT_MILLIS
    }
}

/// Merge per-worker button hints under the engine debounce: a button is
/// enabled only when every unfinished connection offers it and the engine
/// wait has elapsed.
pub fn merge_button_availability(
    progresses: &[ConnectionProgress],
    debounce: &ButtonDebounce,
    now_millis: u64,
) -> ButtonAvailability {
    let unfinished: Vec<&ConnectionProgress> = progresses
        .iter()
        .filter(|p| {
            p.total_connection_write_progress < 1.0
                || p.details_status != TransferStatus::ConnectionComplete
        })
        .collect();

    let pause = !unfinished.is_empty()
        && unfinished.iter().all(|p| p.button_availability.pause)
        && debounce.pause_wait_complete(now_millis);
    let start = (unfinished.is_empty() || unfinished.iter().all(|p| p.button_availability.start))
        && debounce.start_wait_complete(now_millis);
    ButtonAvailability { pause, start }
}

/// Resolve the download-level status from per-worker statuses. Later rules
/// override earlier ones: worker 0's status, then `Connecting` when every
/// worker is connecting, then `ConnectionComplete` at full progress, then
/// `Downloading` when any worker is downloading.
pub fn resolve_status(
    progresses: &[ConnectionProgress],
    total_progress: f64,
) -> TransferStatus {
    let mut status = progresses
        .iter()
        .find(|p| p.connection_number == 0)
        .map(|p| p.status)
        .unwrap_or(TransferStatus::Pending);

    if !progresses.is_empty()
        && progresses
            .iter()
            .all(|p| p.status == TransferStatus::Connecting)
    {
        status = TransferStatus::Connecting;
    }
    if total_progress >= 1.0 {
        status = TransferStatus::ConnectionComplete;
    }
    if progresses
        .iter()
        .any(|p| p.status == TransferStatus::Downloading)
    {
        status = TransferStatus::Downloading;
    }
    status
}

/// Sum of the per-connection transfer rates.
pub fn total_transfer_rate(progresses: &[ConnectionProgress]) -> f64 {
    progresses.iter().map(|p| p.bytes_transfer_rate).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(conn: u32, status: TransferStatus) -> ConnectionProgress {
        ConnectionProgress {
            connection_number: conn,
            status,
            details_status: status,
            download_progress: 0.0,
            total_download_progress: 0.0,
            total_connection_write_progress: 0.0,
            total_received_bytes: 0,
            bytes_transfer_rate: 0.0,
            button_availability: ButtonAvailability::default(),
            completion_signal: false,
            segment: None,
        }
    }

    #[test]
    fn test_format_duration_drops_leading_zeros() {
        assert_eq!(format_duration(5), "5 Seconds");
        assert_eq!(format_duration(65), "1 Minutes, 5 Seconds");
        assert_eq!(format_duration(3_600), "1 Hours, 0 Minutes, 0 Seconds");
        assert_eq!(
            format_duration(90_061),
            "1 Days, 1 Hours, 1 Minutes, 1 Seconds"
        );
    }

    #[test]
    fn test_format_transfer_rate() {
        assert_eq!(format_transfer_rate(512.0), "512 B/s");
        assert_eq!(format_transfer_rate(2048.0), "2.00 KB/s");
        assert_eq!(format_transfer_rate(1_310_720.0), "1.25 MB/s");
    }

    #[test]
    fn test_eta_seconds() {
        assert_eq!(eta_seconds(1_000, 0.5, 100.0), Some(5));
        assert_eq!(eta_seconds(1_000, 1.0, 0.0), Some(0));
        assert_eq!(eta_seconds(1_000, 0.5, 0.0), None);
    }

    #[test]
    fn test_eta_state_throttles() {
        let mut eta = EtaState::default();
        eta.update(0, 1_000, 0.0, 100.0);
        assert_eq!(eta.seconds, Some(10));
        // 400 ms later with a new rate: throttled, unchanged.
        eta.update(400, 1_000, 0.0, 1_000.0);
        assert_eq!(eta.seconds, Some(10));
        // Past the 1 s throttle: recomputed.
        eta.update(1_100, 1_000, 0.0, 1_000.0);
        assert_eq!(eta.seconds, Some(1));
    }

    #[test]
    fn test_eta_empty_at_completion() {
        let mut eta = EtaState::default();
        eta.update(0, 1_000, 1.0, 0.0);
        assert_eq!(eta.text, "");
    }

    #[test]
    fn test_status_precedence() {
        let all_connecting = vec![
            progress(0, TransferStatus::Connecting),
            progress(1, TransferStatus::Connecting),
        ];
        assert_eq!(
            resolve_status(&all_connecting, 0.0),
            TransferStatus::Connecting
        );

        let one_downloading = vec![
            progress(0, TransferStatus::Connecting),
            progress(1, TransferStatus::Downloading),
        ];
        assert_eq!(
            resolve_status(&one_downloading, 0.0),
            TransferStatus::Downloading
        );

        let done = vec![progress(0, TransferStatus::ConnectionComplete)];
        assert_eq!(resolve_status(&done, 1.0), TransferStatus::ConnectionComplete);
    }

    #[test]
    fn test_button_debounce() {
        let debounce = ButtonDebounce::new(1_000);
        assert!(!debounce.pause_wait_complete(1_500));
        assert!(debounce.pause_wait_complete(3_000));

        let mut hinted = progress(0, TransferStatus::Downloading);
        hinted.button_availability = ButtonAvailability { pause: true, start: false };
        let merged = merge_button_availability(&[hinted.clone()], &debounce, 3_100);
        assert!(merged.pause);
        assert!(!merged.start);

        // Before the debounce elapses the hint is suppressed.
        let merged = merge_button_availability(&[hinted], &debounce, 1_100);
        assert!(!merged.pause);
    }
}
