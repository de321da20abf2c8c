// Data source abstraction — pluggable backends for HTTP and future transports.

pub mod http_source;
pub mod traits;

pub use http_source::HttpSource;
pub use traits::{ByteStream, DownloadSource, FileInfo};
