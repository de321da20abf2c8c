// Engine orchestration — coordinator state machine, per-download channels,
// connection workers, and progress aggregation.

pub mod channel;
pub mod coordinator;
pub mod messages;
pub mod progress;
pub mod worker;

pub use coordinator::{Engine, EngineHandle};
