//! Multi-connection HTTP download engine.
//!
//! A download's byte range is split across parallel range-request workers by
//! a dynamic segment tree; workers stream their ranges into per-range temp
//! files, and the coordinator stitches them into the final artifact once
//! every range is covered. Callers drive the engine through a command
//! channel and observe it through an aggregated progress stream:
//!
//! ```no_run
//! use rapidget_engine::config::DownloadSettings;
//! use rapidget_engine::engine::messages::{Command, DownloadCommand, DownloadItem, TransferStatus};
//! use rapidget_engine::engine::Engine;
//!
//! # async fn demo(item: DownloadItem, settings: DownloadSettings) {
//! let mut handle = Engine::new().spawn();
//! handle
//!     .send(DownloadCommand::new(Command::Start, item, settings))
//!     .await
//!     .unwrap();
//! while let Some(progress) = handle.next_progress().await {
//!     if progress.status == TransferStatus::AssembleComplete {
//!         break;
//!     }
//! }
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod segment;
pub mod source;
pub mod store;

pub use engine::{Engine, EngineHandle};
pub use error::EngineError;
pub use segment::Segment;

use std::sync::Once;

use tracing::info;
use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Install the default tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        info!("download engine tracing initialized");
    });
}
