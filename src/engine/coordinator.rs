// Engine coordinator — the actor that owns every download's state machine.
//
// One coordinator task drives all downloads: it consumes caller commands and
// worker messages from its channels, runs the four periodic timers (dynamic
// spawn, connection reuse, stall reset, button notification), mutates the
// per-download segment trees, and triggers final assembly. Workers never share
// memory with the coordinator; all coupling is message passing.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{
    BUTTON_NOTIFY_PERIOD_MILLIS, NEAR_COMPLETION_ETA_SECS, RESET_TIMER_PERIOD_MILLIS,
    REUSE_TIMER_PERIOD_MILLIS, SPAWN_TIMER_PERIOD_MILLIS,
};
use crate::engine::channel::{EngineChannel, WorkerHandle};
use crate::engine::messages::{
    Command, ConnectionHandshake, ConnectionProgress, ConnectionSegmentMessage, DownloadCommand,
    DownloadItem, DownloadProgress, InternalSegmentMessage, TransferStatus, WorkerMessage,
};
use crate::engine::progress::{
    format_transfer_rate, merge_button_availability, resolve_status, total_transfer_rate,
};
use crate::engine::worker::ConnectionWorker;
use crate::error::EngineError;
use crate::segment::tree::{NodeId, SegmentStatus, SegmentTree};
use crate::segment::Segment;
use crate::source::{DownloadSource, HttpSource};
use crate::store::{assemble::assemble, TempFileStore};

type SourceFactory = Arc<dyn Fn(&DownloadItem) -> Arc<dyn DownloadSource> + Send + Sync>;
type WorkerSender = mpsc::Sender<(Uuid, WorkerMessage)>;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const WORKER_CHANNEL_CAPACITY: usize = 1024;
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// The engine's caller-facing side: a command sender and the aggregated
/// progress stream.
pub struct EngineHandle {
    command_tx: mpsc::Sender<DownloadCommand>,
    progress_rx: mpsc::Receiver<DownloadProgress>,
}

impl EngineHandle {
    pub async fn send(&self, command: DownloadCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("engine coordinator has shut down"))
    }

    /// Next aggregated progress event. `None` once the coordinator is gone.
    pub async fn next_progress(&mut self) -> Option<DownloadProgress> {
        self.progress_rx.recv().await
    }
}

/// Constructed once per process; `spawn` starts the coordinator task and
/// returns its handle. There is no hidden static state — dropping the handle
/// shuts the engine down.
pub struct Engine {
    source_factory: SourceFactory,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            source_factory: Arc::new(|item: &DownloadItem| {
                Arc::new(HttpSource::new(item.download_url.clone())) as Arc<dyn DownloadSource>
            }),
        }
    }

    /// Substitute the transport, e.g. for tests.
    pub fn with_source_factory<F>(factory: F) -> Self
    where
        F: Fn(&DownloadItem) -> Arc<dyn DownloadSource> + Send + Sync + 'static,
    {
        Self {
            source_factory: Arc::new(factory),
        }
    }

    pub fn spawn(self) -> EngineHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);

        let coordinator = Coordinator {
            registry: HashMap::new(),
            command_rx,
            progress_tx,
            worker_tx,
            worker_rx,
            source_factory: self.source_factory,
            epoch: Instant::now(),
        };
        tokio::spawn(coordinator.run());

        EngineHandle {
            command_tx,
            progress_rx,
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

struct Coordinator {
    /// Live downloads, keyed by item uid. Mutated only by this task.
    registry: HashMap<Uuid, EngineChannel>,
    command_rx: mpsc::Receiver<DownloadCommand>,
    progress_tx: mpsc::Sender<DownloadProgress>,
    worker_tx: WorkerSender,
    worker_rx: mpsc::Receiver<(Uuid, WorkerMessage)>,
    source_factory: SourceFactory,
    epoch: Instant,
}

impl Coordinator {
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn run(mut self) {
        let mut spawn_timer = interval(Duration::from_millis(SPAWN_TIMER_PERIOD_MILLIS));
        let mut reuse_timer = interval(Duration::from_millis(REUSE_TIMER_PERIOD_MILLIS));
        let mut reset_timer = interval(Duration::from_millis(RESET_TIMER_PERIOD_MILLIS));
        let mut button_timer = interval(Duration::from_millis(BUTTON_NOTIFY_PERIOD_MILLIS));
        for timer in [
            &mut spawn_timer,
            &mut reuse_timer,
            &mut reset_timer,
            &mut button_timer,
        ] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // Handle dropped: shut down.
                    None => break,
                },
                Some((uid, msg)) = self.worker_rx.recv() => {
                    self.handle_worker_message(uid, msg).await;
                }
                _ = spawn_timer.tick() => self.on_spawn_tick(),
                _ = reuse_timer.tick() => self.on_reuse_tick(),
                _ = reset_timer.tick() => self.on_reset_tick(),
                _ = button_timer.tick() => self.on_button_tick().await,
            }
        }
        info!("engine coordinator stopped");
    }

    // ── command intake ───────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: DownloadCommand) {
        match cmd.command {
            Command::Start => self.handle_start(cmd).await,
            Command::Pause => self.handle_pause(cmd.item.uid),
            Command::Cancel => self.handle_cancel(cmd.item.uid).await,
            // Targeted worker commands pass straight through.
            _ => self.forward_to_worker(cmd),
        }
    }

    async fn handle_start(&mut self, cmd: DownloadCommand) {
        // Re-calling start on a finished download is a no-op.
        if cmd.item.status == TransferStatus::AssembleComplete {
            return;
        }
        let uid = cmd.item.uid;
        let now = self.now_millis();

        if let Some(channel) = self.registry.get_mut(&uid) {
            // Re-entry: resume every existing worker.
            channel.paused = false;
            channel.spawn_ignored = false;
            channel.pause_on_final_handshake = false;
            channel.buttons.reset_pause_wait(now);
            for worker in channel.workers.values() {
                let mut resume = cmd.clone();
                resume.command = Command::Start;
                resume.connection_number = Some(worker.connection_number);
                worker.send(resume);
            }
            return;
        }

        if let Err(e) = self.start_download(cmd).await {
            error!("start of download {} failed: {}", uid, e);
        }
    }

    async fn start_download(&mut self, cmd: DownloadCommand) -> Result<(), EngineError> {
        let mut item = cmd.item;
        let settings = cmd.settings;
        let uid = item.uid;
        let now = self.now_millis();
        let store = TempFileStore::new(&settings.base_temp_dir, &uid.to_string());

        // A destination of the wrong length is stale: remove it and rebuild
        // from whatever temp files exist.
        let dest = settings.base_save_dir.join(&item.file_name);
        if let Ok(meta) = fs::metadata(&dest) {
            if meta.len() == item.content_length {
                item.status = TransferStatus::AssembleComplete;
                item.file_path = dest;
                self.emit_bare_progress(item, 1.0, Some(1.0)).await;
                return Ok(());
            }
            warn!(
                "destination {:?} has {} bytes, expected {}; deleting",
                dest,
                meta.len(),
                item.content_length
            );
            fs::remove_file(&dest)?;
        }

        store.validate_integrity(item.content_length, true, false)?;
        let missing = store.find_missing_byte_ranges(item.content_length)?;

        if missing.is_empty() {
            // Everything is on disk already; go straight to assembly.
            match assemble(
                &store,
                &settings.base_save_dir,
                &item.file_name,
                &uid.to_string(),
                item.content_length,
            ) {
                Ok(path) => {
                    item.status = TransferStatus::AssembleComplete;
                    item.file_path = path;
                    item.finish_date = Some(chrono::Utc::now());
                    self.emit_bare_progress(item, 1.0, Some(1.0)).await;
                }
                Err(e) => {
                    error!("assembly of {} failed: {}", uid, e);
                    item.status = TransferStatus::AssembleFailed;
                    self.emit_bare_progress(item, 1.0, None).await;
                }
            }
            return Ok(());
        }

        let whole_file =
            missing.len() == 1 && missing[0] == Segment::new(0, item.content_length - 1);
        let tree = SegmentTree::build_from_missing_bytes(
            item.content_length,
            settings.total_connections,
            &missing,
            now,
        );
        let missing_bytes: u64 = missing.iter().map(|s| s.length()).sum();
        let initially_covered = item.content_length - missing_bytes;

        let source = (self.source_factory)(&item);
        let mut channel =
            EngineChannel::new(item, settings, source, store, tree, initially_covered, now);
        // The recovery path pins the counter so the dynamic spawner stays off.
        channel.created_connections = if whole_file {
            channel.tree.leaf_count() as u32
        } else {
            channel.settings.total_connections
        };

        for leaf in channel.tree.in_queue_leaves() {
            spawn_worker(&mut channel, leaf, &self.worker_tx, now);
        }
        self.registry.insert(uid, channel);
        Ok(())
    }

    fn handle_pause(&mut self, uid: Uuid) {
        let now = self.now_millis();
        let Some(channel) = self.registry.get_mut(&uid) else {
            return;
        };
        channel.paused = true;
        channel.spawn_ignored = true;
        channel.buttons.reset_start_wait(now);
        if !channel.pending_handshakes.is_empty() {
            // Workers still being born will miss this broadcast; re-assert it
            // once the last handshake lands.
            channel.pause_on_final_handshake = true;
        }
        broadcast(channel, Command::Pause);
    }

    async fn handle_cancel(&mut self, uid: Uuid) {
        let now = self.now_millis();
        let Some(mut channel) = self.registry.remove(&uid) else {
            return;
        };
        broadcast(&channel, Command::Cancel);
        channel.item.status = TransferStatus::Canceled;
        let event = aggregate_progress(&mut channel, now, None);
        let _ = self.progress_tx.send(event).await;
    }

    fn forward_to_worker(&mut self, cmd: DownloadCommand) {
        let Some(channel) = self.registry.get(&cmd.item.uid) else {
            return;
        };
        let Some(conn) = cmd.connection_number else {
            debug!("ignoring {:?} without a connection number", cmd.command);
            return;
        };
        if let Some(worker) = channel.workers.get(&conn) {
            worker.send(cmd);
        }
    }

    // ── periodic timers ──────────────────────────────────────────────

    /// Dynamic spawn: split the longest segment and hand its tail to a brand
    /// new connection.
    fn on_spawn_tick(&mut self) {
        let now = self.now_millis();
        for channel in self.registry.values_mut() {
            if !should_create_new_connections(channel) {
                continue;
            }
            match channel.tree.split(now) {
                Ok(parent) => {
                    channel.created_connections += 1;
                    let left = channel.tree.node(parent).left.expect("fresh split");
                    channel
                        .tree
                        .set_status(parent, SegmentStatus::RefreshRequested, now);
                    channel
                        .tree
                        .set_status(left, SegmentStatus::RefreshRequested, now);

                    let parent_segment = channel.tree.node(parent).segment;
                    let left_segment = channel.tree.node(left).segment;
                    match channel.worker_for_segment(&parent_segment) {
                        Some(donor) => {
                            let mut refresh = DownloadCommand::new(
                                Command::RefreshSegment,
                                channel.item.clone(),
                                channel.settings.clone(),
                            );
                            refresh.segment = Some(left_segment);
                            refresh.connection_number = Some(donor.connection_number);
                            donor.send(refresh);
                        }
                        None => {
                            error!(
                                "no worker serves {}; suspending dynamic growth for {}",
                                parent_segment, channel.item.uid
                            );
                            channel.tree_faulted = true;
                        }
                    }
                }
                Err(EngineError::SegmentTooSmall) => {
                    debug!("no splittable segment for {}", channel.item.uid);
                }
                Err(e) => {
                    error!("split failed for {}: {}", channel.item.uid, e);
                    channel.tree_faulted = true;
                }
            }
        }
    }

    /// Dynamic reuse: recycle a finished connection onto the tail of the
    /// stalest live segment.
    fn on_reuse_tick(&mut self) {
        let now = self.now_millis();
        for channel in self.registry.values_mut() {
            if channel.reuse_queue.is_empty()
                || channel.paused
                || channel.tree_faulted
                || should_create_new_connections(channel)
                || channel.any_awaiting_reset()
                || channel.total_progress() >= 1.0
            {
                continue;
            }
            let Some(reuser) = channel.reuse_queue.pop_front() else {
                continue;
            };
            let reuser_segment = channel.workers.get(&reuser).map(|w| w.segment);

            let in_queue = channel.tree.in_queue_leaves();
            let candidates = if in_queue.is_empty() {
                channel.tree.in_use_leaves()
            } else {
                in_queue
            };
            let Some(target) = channel.tree.oldest_leaf(&candidates, reuser_segment.as_ref())
            else {
                channel.reuse_queue.push_front(reuser);
                continue;
            };

            let target_segment = channel.tree.node(target).segment;
            if channel.worker_for_segment(&target_segment).is_none()
                && channel.tree.node(target).status == SegmentStatus::Initial
            {
                // Nobody serves this leaf yet; the recycled worker can take it
                // whole instead of splitting it.
                channel.tree.set_connection_number(target, reuser);
                channel
                    .tree
                    .set_status(target, SegmentStatus::ReuseRequested, now);
                send_reuse_start(channel, reuser, target_segment);
                continue;
            }

            if !channel.tree.split_segment_node(target, false, now) {
                debug!(
                    "reuse split of {} refused for {}",
                    target_segment, channel.item.uid
                );
                channel.reuse_queue.push_front(reuser);
                continue;
            }
            let left = channel.tree.node(target).left.expect("fresh split");
            let right = channel.tree.node(target).right.expect("fresh split");
            channel.tree.set_connection_number(right, reuser);
            channel
                .tree
                .set_status(target, SegmentStatus::RefreshRequested, now);
            channel
                .tree
                .set_status(left, SegmentStatus::RefreshRequested, now);

            let left_segment = channel.tree.node(left).segment;
            match channel.worker_for_segment(&target_segment) {
                Some(donor) => {
                    let mut refresh = DownloadCommand::new(
                        Command::RefreshSegmentReuseConnection,
                        channel.item.clone(),
                        channel.settings.clone(),
                    );
                    refresh.segment = Some(left_segment);
                    refresh.connection_number = Some(donor.connection_number);
                    donor.send(refresh);
                }
                None => {
                    error!(
                        "no worker serves {}; abandoning reuse for {}",
                        target_segment, channel.item.uid
                    );
                    let _ = channel.tree.collapse(target, now);
                    channel.tree.set_status(target, SegmentStatus::InUse, now);
                    channel.enqueue_reuse(reuser);
                }
            }
        }
    }

    /// Stall reset: prod workers that have gone quiet.
    fn on_reset_tick(&mut self) {
        let now = self.now_millis();
        for channel in self.registry.values_mut() {
            if channel.paused {
                continue;
            }
            let item = channel.item.clone();
            let settings = channel.settings.clone();
            let timeout = settings.connection_retry_timeout_millis;
            let max_retries = settings.max_connection_retry_count;

            for worker in channel.workers.values_mut() {
                if worker.details_status.is_settled() {
                    continue;
                }
                let retries_left =
                    max_retries == -1 || (worker.reset_count as i64) < max_retries as i64;
                if !retries_left {
                    continue;
                }
                if worker.last_response_millis + timeout >= now {
                    continue;
                }
                debug!(
                    "connection {} of {} silent for over {} ms; resetting",
                    worker.connection_number, item.uid, timeout
                );
                let mut reset =
                    DownloadCommand::new(Command::ResetConnection, item.clone(), settings.clone());
                reset.connection_number = Some(worker.connection_number);
                worker.send(reset);
                worker.awaiting_reset_response = true;
                worker.reset_count += 1;
            }
        }
    }

    /// Button notification: paused downloads get periodic availability events
    /// even without worker traffic.
    async fn on_button_tick(&mut self) {
        let paused: Vec<Uuid> = self
            .registry
            .values()
            .filter(|c| c.paused)
            .map(|c| c.uid())
            .collect();
        for uid in paused {
            self.emit_progress(uid).await;
        }
    }

    // ── worker messages ──────────────────────────────────────────────

    async fn handle_worker_message(&mut self, uid: Uuid, msg: WorkerMessage) {
        if !self.registry.contains_key(&uid) {
            // Stale traffic from a download that finished or was canceled.
            return;
        }
        match msg {
            WorkerMessage::Handshake(h) => self.on_handshake(uid, h),
            WorkerMessage::Segment(m) => self.on_segment_message(uid, m),
            WorkerMessage::Progress(p) => self.on_progress(uid, p).await,
            WorkerMessage::Log(l) => {
                let channel = self.registry.get_mut(&uid).expect("checked above");
                debug!("download {}: {}", uid, l.log);
                channel.push_log(l.log);
            }
        }
    }

    fn on_handshake(&mut self, uid: Uuid, handshake: ConnectionHandshake) {
        let now = self.now_millis();
        let channel = self.registry.get_mut(&uid).expect("caller checked");
        let conn = handshake.new_connection_number;
        channel.pending_handshakes.remove(&conn);

        if handshake.reuse_connection {
            let reuse_leaf = channel
                .tree
                .leaves_with_status(SegmentStatus::ReuseRequested)
                .into_iter()
                .find(|id| channel.tree.node(*id).connection_number == Some(conn));
            if let Some(leaf) = reuse_leaf {
                channel.tree.set_status(leaf, SegmentStatus::InUse, now);
            }
        }
        if let Some(worker) = channel.workers.get_mut(&conn) {
            worker.last_response_millis = now;
        }

        if channel.pending_handshakes.is_empty() && channel.pause_on_final_handshake {
            channel.pause_on_final_handshake = false;
            broadcast(channel, Command::Pause);
        }
    }

    fn on_segment_message(&mut self, uid: Uuid, msg: ConnectionSegmentMessage) {
        let now = self.now_millis();
        let channel = self.registry.get_mut(&uid).expect("caller checked");

        let Some(leaf) = channel.tree.search(&msg.requested_segment) else {
            error!(
                "no leaf matches refreshed segment {} of {}; suspending dynamic growth",
                msg.requested_segment, uid
            );
            channel.tree_faulted = true;
            return;
        };
        let Some(parent) = channel.tree.node(leaf).parent else {
            error!(
                "leaf {} of {} has no parent; suspending dynamic growth",
                msg.requested_segment, uid
            );
            channel.tree_faulted = true;
            return;
        };

        match msg.internal {
            InternalSegmentMessage::RefreshSegmentSuccess => {
                self.finish_refresh(uid, msg.connection_number, parent, leaf, msg.reuse_connection);
            }
            InternalSegmentMessage::OverlappingRefreshSegment => {
                // The worker ran past the proposed boundary; accept its
                // corrected ranges and hand over from its current position.
                let (Some(rs), Some(re), Some(vs), Some(ve)) = (
                    msg.refreshed_start_byte,
                    msg.refreshed_end_byte,
                    msg.valid_new_start_byte,
                    msg.valid_new_end_byte,
                ) else {
                    warn!("overlap response without corrected ranges from {}", uid);
                    channel.tree_faulted = true;
                    return;
                };
                let right = channel.tree.node(parent).right.expect("split parent");
                channel.tree.set_segment(leaf, Segment::new(rs, re));
                channel.tree.set_segment(right, Segment::new(vs, ve));
                self.finish_refresh(uid, msg.connection_number, parent, leaf, msg.reuse_connection);
            }
            InternalSegmentMessage::RefreshSegmentRefused
            | InternalSegmentMessage::ReuseConnectionRefreshSegmentRefused => {
                let right = channel.tree.node(parent).right;
                let reuser = right.and_then(|r| channel.tree.node(r).connection_number);
                if let Err(e) = channel.tree.collapse(parent, now) {
                    error!("collapse after refusal failed for {}: {}", uid, e);
                    channel.tree_faulted = true;
                    return;
                }
                // The reinstated leaf keeps its worker and its whole segment;
                // created_connections is intentionally left alone so the leaf
                // stays eligible for a later split.
                channel.tree.set_status(parent, SegmentStatus::InUse, now);
                if msg.internal == InternalSegmentMessage::ReuseConnectionRefreshSegmentRefused {
                    if let Some(reuser) = reuser {
                        channel.enqueue_reuse(reuser);
                    }
                }
            }
        }
    }

    /// Shared tail of the refresh-success and overlap paths: retire the
    /// parent, put the donor back to work on the left child, and start the
    /// right child on a recycled or brand-new connection.
    fn finish_refresh(
        &mut self,
        uid: Uuid,
        donor_conn: u32,
        parent: NodeId,
        left: NodeId,
        reuse: bool,
    ) {
        let now = self.now_millis();
        let worker_tx = self.worker_tx.clone();
        let Some(channel) = self.registry.get_mut(&uid) else {
            return;
        };
        let right = channel.tree.node(parent).right.expect("split parent");

        channel.tree.mark_out_dated(parent, now);
        channel.tree.set_status(left, SegmentStatus::InUse, now);
        let left_segment = channel.tree.node(left).segment;
        if let Some(donor) = channel.workers.get_mut(&donor_conn) {
            donor.segment = left_segment;
            donor.last_response_millis = now;
        }

        let right_segment = channel.tree.node(right).segment;
        if reuse {
            let Some(reuser) = channel.tree.node(right).connection_number else {
                error!("reuse split of {} lost its connection number", uid);
                channel.tree_faulted = true;
                return;
            };
            channel
                .tree
                .set_status(right, SegmentStatus::ReuseRequested, now);
            send_reuse_start(channel, reuser, right_segment);
        } else {
            channel.tree.set_status(right, SegmentStatus::InUse, now);
            spawn_worker(channel, right, &worker_tx, now);
        }
    }

    async fn on_progress(&mut self, uid: Uuid, progress: ConnectionProgress) {
        let now = self.now_millis();
        let channel = self.registry.get_mut(&uid).expect("caller checked");
        let conn = progress.connection_number;

        channel.connection_progresses.insert(conn, progress.clone());

        if let Some(worker) = channel.workers.get_mut(&conn) {
            worker.status = progress.status;
            worker.details_status = progress.details_status;
            worker.last_response_millis = now;
            worker.button_availability = progress.button_availability;
            if let Some(segment) = progress.segment {
                worker.segment = segment;
            }
            if progress.status == TransferStatus::Downloading {
                // The reset round-trip is complete once bytes flow again.
                worker.awaiting_reset_response = false;
            }
        }

        if progress.completion_signal {
            channel.enqueue_reuse(conn);
            let leaf = progress
                .segment
                .and_then(|s| channel.tree.search(&s))
                .or_else(|| channel.tree.leaf_for_connection(conn));
            if let Some(leaf) = leaf {
                channel.tree.set_status(leaf, SegmentStatus::Complete, now);
            }
        }

        let assemble_eligible = !matches!(
            channel.item.status,
            TransferStatus::AssembleComplete | TransferStatus::AssembleFailed
        ) && !channel.assemble_requested;
        if assemble_eligible && channel.temp_writes_complete() {
            channel.assemble_requested = true;
            self.run_assembly(uid).await;
            return;
        }

        self.emit_progress(uid).await;
    }

    // ── assembly & progress emission ─────────────────────────────────

    /// Terminal phase: stitch the temp files together. Synchronous I/O is
    /// fine here — every worker has already reported its writes complete.
    async fn run_assembly(&mut self, uid: Uuid) {
        let now = self.now_millis();
        let Some(channel) = self.registry.get_mut(&uid) else {
            return;
        };
        let result = assemble(
            &channel.store,
            &channel.settings.base_save_dir,
            &channel.item.file_name,
            &uid.to_string(),
            channel.item.content_length,
        );
        match result {
            Ok(path) => {
                channel.item.status = TransferStatus::AssembleComplete;
                channel.item.file_path = path;
                channel.item.finish_date = Some(chrono::Utc::now());
                let mut done = self.registry.remove(&uid).expect("channel fetched above");
                let event = aggregate_progress(&mut done, now, Some(1.0));
                let _ = self.progress_tx.send(event).await;
                info!("download {} assembled", uid);
            }
            Err(e) => {
                // Temp files stay on disk so a later start can retry.
                error!("assembly of {} failed: {}", uid, e);
                channel.item.status = TransferStatus::AssembleFailed;
                self.emit_progress(uid).await;
            }
        }
    }

    async fn emit_progress(&mut self, uid: Uuid) {
        let now = self.now_millis();
        let Some(channel) = self.registry.get_mut(&uid) else {
            return;
        };
        let event = aggregate_progress(channel, now, None);
        let _ = self.progress_tx.send(event).await;
    }

    /// Progress event for a download that never got (or no longer has) an
    /// engine channel, e.g. direct assembly at start.
    async fn emit_bare_progress(
        &self,
        item: DownloadItem,
        total: f64,
        assemble_progress: Option<f64>,
    ) {
        let status = item.status;
        let event = DownloadProgress {
            item,
            status,
            download_progress: total,
            total_download_progress: total,
            transfer_rate: String::new(),
            estimated_remaining: String::new(),
            button_availability: Default::default(),
            connection_progresses: Vec::new(),
            assemble_progress,
        };
        let _ = self.progress_tx.send(event).await;
    }
}

/// Merge a download's state into one caller-facing progress event.
fn aggregate_progress(
    channel: &mut EngineChannel,
    now_millis: u64,
    assemble_progress: Option<f64>,
) -> DownloadProgress {
    let progresses: Vec<ConnectionProgress> =
        channel.connection_progresses.values().cloned().collect();
    let total = channel.total_progress();
    let rate = total_transfer_rate(&progresses);
    channel
        .eta
        .update(now_millis, channel.item.content_length, total, rate);

    let status = match channel.item.status {
        s @ (TransferStatus::AssembleComplete
        | TransferStatus::AssembleFailed
        | TransferStatus::Canceled) => s,
        _ if channel.paused => TransferStatus::Paused,
        _ => resolve_status(&progresses, total),
    };

    DownloadProgress {
        item: channel.item.clone(),
        status,
        download_progress: channel.session_progress(),
        total_download_progress: total,
        transfer_rate: format_transfer_rate(rate),
        estimated_remaining: channel.eta.text.clone(),
        button_availability: merge_button_availability(&progresses, &channel.buttons, now_millis),
        connection_progresses: progresses,
        assemble_progress,
    }
}

/// Spawn a worker for `leaf` and hand it its opening command. The worker runs
/// in its own task; anything that goes wrong inside it comes back as
/// messages, never as a dead task.
fn spawn_worker(channel: &mut EngineChannel, leaf: NodeId, worker_tx: &WorkerSender, now: u64) {
    let node = channel.tree.node(leaf);
    let Some(conn) = node.connection_number else {
        warn!(
            "leaf {} has no connection number; skipping spawn",
            node.segment
        );
        return;
    };
    let segment = node.segment;
    let previously_written = channel.tree.completed_bytes_for_connection(conn);

    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let worker = ConnectionWorker::new(
        channel.item.clone(),
        channel.settings.clone(),
        channel.source.clone(),
        conn,
        rx,
        worker_tx.clone(),
    );
    tokio::spawn(worker.run());

    let handle = WorkerHandle::new(conn, tx, segment, now);
    let mut start = DownloadCommand::new(
        Command::StartInitial,
        channel.item.clone(),
        channel.settings.clone(),
    );
    start.segment = Some(segment);
    start.connection_number = Some(conn);
    start.previously_written_byte_length = previously_written;
    handle.send(start);

    channel.workers.insert(conn, handle);
    channel.pending_handshakes.insert(conn);
    channel.tree.set_status(leaf, SegmentStatus::InUse, now);
    debug!("spawned connection {} for {}", conn, segment);
}

/// Send `command` to every worker of the download, connection number filled
/// in per worker.
fn broadcast(channel: &EngineChannel, command: Command) {
    for worker in channel.workers.values() {
        let mut cmd =
            DownloadCommand::new(command, channel.item.clone(), channel.settings.clone());
        cmd.connection_number = Some(worker.connection_number);
        worker.send(cmd);
    }
}

/// Hand `segment` to the recycled worker `reuser` and mirror the handover.
fn send_reuse_start(channel: &mut EngineChannel, reuser: u32, segment: Segment) {
    let Some(worker) = channel.workers.get_mut(&reuser) else {
        warn!("recycled connection {} has no worker handle", reuser);
        return;
    };
    worker.segment = segment;
    worker.status = TransferStatus::Connecting;
    worker.details_status = TransferStatus::Connecting;
    let mut start = DownloadCommand::new(
        Command::StartReuseConnection,
        channel.item.clone(),
        channel.settings.clone(),
    );
    start.segment = Some(segment);
    start.connection_number = Some(reuser);
    worker.send(start);
}

/// The dynamic-spawn predicate: grow only while no refresh is in flight, the
/// connection budget is not exhausted, the download is not paused, and
/// completion is not imminent.
fn should_create_new_connections(channel: &EngineChannel) -> bool {
    let total = channel.settings.total_connections;
    !channel.tree_faulted
        && !channel.tree.is_empty()
        && !channel.tree.has_refresh_in_flight()
        && (channel.connection_progresses.len() as u32) < total
        && channel.created_connections < total
        && !channel.spawn_ignored
        && channel
            .eta
            .seconds
            .map_or(true, |s| s >= NEAR_COMPLETION_ETA_SECS)
}
