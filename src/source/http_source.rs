use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use reqwest::{header, Client, StatusCode};
use tracing::{debug, warn};

use super::traits::{ByteStream, DownloadSource, FileInfo};
use crate::config::PROBE_TIMEOUT_SECS;
use crate::error::EngineError;
use crate::segment::Segment;

pub struct HttpSource {
    client: Client,
    url: String,
}

impl HttpSource {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DownloadSource for HttpSource {
    async fn probe(&self) -> Result<FileInfo, EngineError> {
        let resp = self
            .client
            .head(&self.url)
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
            .await?;

        let status = resp.status();
        debug!("head probe status={}", status.as_u16());
        if !status.is_success() {
            return Err(EngineError::UnsupportedSource(format!(
                "HEAD returned HTTP {}",
                status.as_u16()
            )));
        }

        let supports_pause = resp
            .headers()
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        let content_length = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                EngineError::UnsupportedSource("missing content-length header".into())
            })?;
        if content_length == 0 {
            return Err(EngineError::UnsupportedSource("content length is zero".into()));
        }

        let raw_name = resp
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(file_name_from_content_disposition)
            .or_else(|| file_name_from_url(&self.url))
            .unwrap_or_else(|| "download".to_string());

        Ok(FileInfo {
            supports_pause,
            file_name: percent_decode(&raw_name),
            content_length,
        })
    }

    async fn fetch_range(&self, segment: Segment) -> Result<ByteStream, EngineError> {
        let resp = self
            .client
            .get(&self.url)
            .header(header::RANGE, segment.range_header())
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::PARTIAL_CONTENT && !status.is_success() {
            warn!(
                "range fetch failed status={} segment={}",
                status.as_u16(),
                segment
            );
            return Err(EngineError::UnsupportedSource(format!(
                "range fetch returned HTTP {}",
                status.as_u16()
            )));
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(EngineError::Network));
        Ok(stream.boxed())
    }
}

/// Extract the file name from a `Content-Disposition` header value. Handles
/// both `filename="name"` and `filename=name`.
fn file_name_from_content_disposition(value: &str) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    let idx = lower.find("filename=")?;
    let rest = &value[idx + "filename=".len()..];
    let name = if let Some(quoted) = rest.strip_prefix('"') {
        quoted.split('"').next()?
    } else {
        rest.split(';').next()?.trim()
    };
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Last path segment of the URL, minus query and fragment.
fn file_name_from_url(url: &str) -> Option<String> {
    let without_fragment = url.split('#').next()?;
    let without_query = without_fragment.split('?').next()?;
    let segment = without_query.rsplit('/').next()?;
    if segment.is_empty() || segment.contains(':') {
        None
    } else {
        Some(segment.to_string())
    }
}

fn percent_decode(name: &str) -> String {
    percent_decode_str(name)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_quoted() {
        assert_eq!(
            file_name_from_content_disposition(r#"attachment; filename="a file.bin""#),
            Some("a file.bin".to_string())
        );
    }

    #[test]
    fn test_content_disposition_unquoted() {
        assert_eq!(
            file_name_from_content_disposition("attachment; filename=report.pdf; size=3"),
            Some("report.pdf".to_string())
        );
        assert_eq!(file_name_from_content_disposition("attachment"), None);
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://host/path/video.mkv?token=1#frag"),
            Some("video.mkv".to_string())
        );
        assert_eq!(file_name_from_url("https://host/"), None);
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("my%20file.zip"), "my file.zip");
    }
}
