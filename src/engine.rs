//! Download engine boundary
//!
//! The engine performs the actual transfer. Tasks drive it through the
//! `DownloadEngine` trait so the transfer backend stays pluggable; the
//! built-in `HttpEngine` streams over plain HTTP with Range-based resume.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::EngineOptions;
use crate::error::{Result, TaskError};

/// Progress callback: (bytes transferred so far, total bytes if known)
pub type ProgressFn = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Metadata about the remote resource, from a cheap probe
#[derive(Debug, Clone, Default)]
pub struct MediaProbe {
    /// Resource title, if the backend can extract one
    pub title: Option<String>,
    /// File name suggested by the remote side
    pub file_name: Option<String>,
    /// Content type reported by the server
    pub content_type: Option<String>,
    /// Total size in bytes, if known
    pub total_bytes: Option<u64>,
    /// Whether the server supports resuming from a byte offset
    pub supports_resume: bool,
}

/// How a transfer ended.
///
/// Cancellation is cooperative and not an error: the caller that cancelled
/// owns the resulting state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Transfer ran to completion; `bytes` is the final byte position
    Completed { bytes: u64 },
    /// Transfer stopped at the cancellation token; offset is preserved
    Cancelled { bytes: u64 },
}

/// Transfer backend driven by a task worker.
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Probe the resource without transferring it.
    async fn probe(&self, url: &str, options: &EngineOptions) -> Result<MediaProbe>;

    /// Transfer `url` into `dest`, starting at `offset` bytes.
    ///
    /// Reports progress through `progress` as the byte position advances and
    /// returns promptly once `cancel` fires, with all engine resources
    /// released.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        offset: u64,
        options: &EngineOptions,
        progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome>;
}

/// Plain HTTP streaming engine
pub struct HttpEngine {
    client: reqwest::Client,
}

impl HttpEngine {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Proxies are a client-level setting in reqwest, so a proxied task
    /// gets its own client; everything else shares the pooled one.
    fn client_for(&self, options: &EngineOptions) -> Result<reqwest::Client> {
        match &options.proxy {
            Some(proxy) => Ok(reqwest::Client::builder()
                .proxy(reqwest::Proxy::all(proxy)?)
                .build()?),
            None => Ok(self.client.clone()),
        }
    }
}

impl Default for HttpEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Total size from a `Content-Range: bytes 5-99/100` header.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

fn header_str<'a>(resp: &'a reqwest::Response, name: reqwest::header::HeaderName) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl DownloadEngine for HttpEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn probe(&self, url: &str, options: &EngineOptions) -> Result<MediaProbe> {
        let resp = self
            .client_for(options)?
            .head(url)
            .timeout(Duration::from_secs(options.timeout_seconds))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(TaskError::engine(format!(
                "probe of {} failed with status {}",
                url,
                resp.status()
            )));
        }

        let total_bytes = header_str(&resp, reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.parse().ok());
        let content_type =
            header_str(&resp, reqwest::header::CONTENT_TYPE).map(|v| v.to_string());
        let supports_resume = header_str(&resp, reqwest::header::ACCEPT_RANGES)
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        let file_name = header_str(&resp, reqwest::header::CONTENT_DISPOSITION)
            .and_then(parse_disposition_file_name);

        Ok(MediaProbe {
            title: None,
            file_name,
            content_type,
            total_bytes,
            supports_resume,
        })
    }

    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        offset: u64,
        options: &EngineOptions,
        progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome> {
        let mut request = self
            .client_for(options)?
            .get(url)
            .timeout(Duration::from_secs(options.timeout_seconds));
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(TaskError::engine(format!(
                "fetch of {} failed with status {}",
                url,
                resp.status()
            )));
        }

        // A server that ignores the Range header replies 200 with the full
        // body; restart from zero instead of appending a duplicate.
        let resumed = offset > 0 && resp.status() == reqwest::StatusCode::PARTIAL_CONTENT;
        let mut written = if resumed { offset } else { 0 };

        let total_bytes = if resumed {
            header_str(&resp, reqwest::header::CONTENT_RANGE)
                .and_then(content_range_total)
                .or_else(|| {
                    header_str(&resp, reqwest::header::CONTENT_LENGTH)
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(|len| offset + len)
                })
        } else {
            header_str(&resp, reqwest::header::CONTENT_LENGTH).and_then(|v| v.parse().ok())
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = if resumed {
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dest)
                .await?
        } else {
            tokio::fs::File::create(dest).await?
        };

        let mut stream = resp.bytes_stream();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Ok(FetchOutcome::Cancelled { bytes: written });
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        file.write_all(&bytes).await?;
                        written += bytes.len() as u64;
                        if let Some(cb) = &progress {
                            cb(written, total_bytes);
                        }
                        if let Some(limit) = options.rate_limit {
                            // crude throttle: sleep long enough that this
                            // chunk averages out to the configured rate;
                            // cancellation must still cut the sleep short
                            let secs = bytes.len() as f64 / limit as f64;
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    file.flush().await?;
                                    return Ok(FetchOutcome::Cancelled { bytes: written });
                                }
                                _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => {}
                            }
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
            }
        }

        file.flush().await?;
        Ok(FetchOutcome::Completed { bytes: written })
    }
}

/// File name from a `Content-Disposition: attachment; filename="x"` header.
fn parse_disposition_file_name(value: &str) -> Option<String> {
    let part = value
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("filename="))?;
    let name = part.trim_matches('"');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use tempfile::tempdir;

    fn options() -> EngineOptions {
        EngineOptions::default()
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("bytes 5-99/100"), Some(100));
        assert_eq!(content_range_total("bytes 0-0/*"), None);
    }

    #[test]
    fn test_parse_disposition_file_name() {
        assert_eq!(
            parse_disposition_file_name("attachment; filename=\"clip.mp4\"").as_deref(),
            Some("clip.mp4")
        );
        assert_eq!(parse_disposition_file_name("inline"), None);
    }

    #[tokio::test]
    async fn test_probe_reads_headers() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("HEAD", "/clip.mp4")
            .with_status(200)
            .with_header("content-length", "1024")
            .with_header("content-type", "video/mp4")
            .with_header("accept-ranges", "bytes")
            .create_async()
            .await;

        let engine = HttpEngine::new();
        let url = format!("{}/clip.mp4", server.url());
        let probe = engine.probe(&url, &options()).await.unwrap();

        assert_eq!(probe.total_bytes, Some(1024));
        assert_eq!(probe.content_type.as_deref(), Some("video/mp4"));
        assert!(probe.supports_resume);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_streams_to_file() {
        let mut server = Server::new_async().await;
        let body = b"hello world";
        let mock = server
            .mock("GET", "/clip.mp4")
            .with_status(200)
            .with_header("content-length", &body.len().to_string())
            .with_body(body.as_slice())
            .create_async()
            .await;

        let engine = HttpEngine::new();
        let dir = tempdir().unwrap();
        let dest = dir.path().join("clip.mp4");
        let url = format!("{}/clip.mp4", server.url());

        let outcome = engine
            .fetch(&url, &dest, 0, &options(), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Completed { bytes: 11 });
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_resumes_with_range() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/clip.mp4")
            .match_header("range", "bytes=5-")
            .with_status(206)
            .with_header("content-range", "bytes 5-10/11")
            .with_body(" world")
            .create_async()
            .await;

        let engine = HttpEngine::new();
        let dir = tempdir().unwrap();
        let dest = dir.path().join("clip.mp4");
        std::fs::write(&dest, b"hello").unwrap();
        let url = format!("{}/clip.mp4", server.url());

        let outcome = engine
            .fetch(&url, &dest, 5, &options(), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Completed { bytes: 11 });
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_restarts_when_range_ignored() {
        let mut server = Server::new_async().await;
        let body = b"hello world";
        let _mock = server
            .mock("GET", "/clip.mp4")
            .with_status(200)
            .with_body(body.as_slice())
            .create_async()
            .await;

        let engine = HttpEngine::new();
        let dir = tempdir().unwrap();
        let dest = dir.path().join("clip.mp4");
        std::fs::write(&dest, b"hello").unwrap();
        let url = format!("{}/clip.mp4", server.url());

        // server ignored the Range header, so the file must be rewritten
        // from scratch rather than appended
        let outcome = engine
            .fetch(&url, &dest, 5, &options(), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Completed { bytes: 11 });
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn test_fetch_cancellation_cuts_rate_limit_sleep_short() {
        let mut server = Server::new_async().await;
        let payload = vec![b'x'; 16 * 1024];
        let _mock = server
            .mock("GET", "/big.bin")
            .with_status(200)
            .with_header("content-length", &payload.len().to_string())
            .with_body(payload)
            .create_async()
            .await;

        let engine = HttpEngine::new();
        let dir = tempdir().unwrap();
        let dest = dir.path().join("big.bin");
        let url = format!("{}/big.bin", server.url());

        // 1 KiB/s against a 16 KiB body: the transfer would take ~16s if
        // the throttle ignored cancellation
        let options = EngineOptions {
            rate_limit: Some(1024),
            ..EngineOptions::default()
        };

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = engine
            .fetch(&url, &dest, 0, &options, None, cancel)
            .await
            .unwrap();

        assert!(matches!(outcome, FetchOutcome::Cancelled { .. }));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "cancellation took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_fetch_cancellation_stops_transfer() {
        let mut server = Server::new_async().await;
        let payload = vec![b'x'; 4096];
        let _mock = server
            .mock("GET", "/slow.bin")
            .with_status(200)
            .with_header("content-length", &payload.len().to_string())
            .with_chunked_body(move |w| {
                use std::io::Write;
                for chunk in payload.chunks(512) {
                    std::thread::sleep(Duration::from_millis(100));
                    w.write_all(chunk)?;
                }
                Ok(())
            })
            .create_async()
            .await;

        let engine = HttpEngine::new();
        let dir = tempdir().unwrap();
        let dest = dir.path().join("slow.bin");
        let url = format!("{}/slow.bin", server.url());

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            canceller.cancel();
        });

        let outcome = engine
            .fetch(&url, &dest, 0, &options(), None, cancel)
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Cancelled { bytes } => assert!(bytes < 4096),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }
}
