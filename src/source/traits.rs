use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::EngineError;
use crate::segment::Segment;

/// Chunks of a ranged response as they arrive from the network.
pub type ByteStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// What a HEAD probe learned about a download source.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Whether the server honors `Range` requests (`Accept-Ranges: bytes`),
    /// and therefore whether the download can be paused and resumed.
    pub supports_pause: bool,
    pub file_name: String,
    pub content_length: u64,
}

#[async_trait]
pub trait DownloadSource: Send + Sync {
    async fn probe(&self) -> Result<FileInfo, EngineError>;
    async fn fetch_range(&self, segment: Segment) -> Result<ByteStream, EngineError>;
}
