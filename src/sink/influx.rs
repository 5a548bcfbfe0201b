//! InfluxDB v2 sink
//!
//! Lines are buffered until `flush`, then posted as one request to
//! `/api/v2/write` on a background task. The writer never waits for the
//! response; failures go to the error channel.

use super::{ErrorSender, Sink, WriteError};
use crate::config::{ConfigError, InfluxConfig, DEFAULT_BATCH_SIZE};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Url};
use std::future::Future;
use std::pin::Pin;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Longest response body kept in a `Rejected` error
const ERROR_BODY_MAX: usize = 512;

pub struct InfluxSink {
    client: Client,
    write_url: Url,
    auth_header: String,
    buffer: Vec<String>,
    max_buffered_lines: usize,
    errors: ErrorSender,
    in_flight: JoinSet<()>,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig, errors: ErrorSender) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {}", e)))?;
        let max_buffered_lines = config
            .max_buffered_lines
            .unwrap_or(DEFAULT_BATCH_SIZE)
            .max(1);

        Ok(InfluxSink {
            client,
            write_url: write_url(config)?,
            auth_header: format!("Token {}", config.token),
            buffer: Vec::with_capacity(max_buffered_lines.min(4096)),
            max_buffered_lines,
            errors,
            in_flight: JoinSet::new(),
        })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }

    /// Number of write requests not yet completed
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.in_flight.try_join_next() {
            if let Err(e) = result {
                error!("InfluxDB write task failed: {}", e);
            }
        }
    }
}

/// `{url}/api/v2/write?org=..&bucket=..&precision=ns`
pub fn write_url(config: &InfluxConfig) -> Result<Url, ConfigError> {
    let base = format!("{}/api/v2/write", config.url.trim_end_matches('/'));
    Url::parse_with_params(
        &base,
        &[
            ("org", config.org.as_str()),
            ("bucket", config.bucket.as_str()),
            ("precision", "ns"),
        ],
    )
    .map_err(|e| ConfigError::Invalid(format!("invalid InfluxDB url '{}': {}", config.url, e)))
}

/// Shorten `s` to at most `max` bytes without splitting a character
fn truncate_on_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

impl Sink for InfluxSink {
    fn write_record(&mut self, line: String) {
        self.buffer.push(line);
        // Client-side batch size limit
        if self.buffer.len() >= self.max_buffered_lines {
            self.flush();
        }
    }

    fn flush(&mut self) {
        self.reap_finished();
        if self.buffer.is_empty() {
            return;
        }

        let lines = self.buffer.len();
        let body = std::mem::take(&mut self.buffer).join("\n");
        let request = self
            .client
            .post(self.write_url.clone())
            .header(AUTHORIZATION, self.auth_header.as_str())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        let errors = self.errors.clone();

        self.in_flight.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("InfluxDB accepted {} lines", lines);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let mut body = response.text().await.unwrap_or_default();
                    truncate_on_char_boundary(&mut body, ERROR_BODY_MAX);
                    errors.report(WriteError::rejected(lines, status, body));
                }
                Err(e) => errors.report(WriteError::transport(lines, e.to_string())),
            }
        });
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.flush();
            while let Some(result) = self.in_flight.join_next().await {
                if let Err(e) = result {
                    error!("InfluxDB write task failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{error_channel, WriteErrorKind};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config(url: &str) -> InfluxConfig {
        InfluxConfig {
            url: url.to_string(),
            org: "yomo".to_string(),
            bucket: "noise".to_string(),
            token: "secret".to_string(),
            max_buffered_lines: Some(1000),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Accept one HTTP request, answer with `status` and `body`, return the raw request
    async fn serve_once(listener: TcpListener, status: &'static str, body: String) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if request.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }

        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        String::from_utf8_lossy(&request).to_string()
    }

    #[test]
    fn test_write_url() {
        let url = write_url(&test_config("http://localhost:8086/")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8086/api/v2/write?org=yomo&bucket=noise&precision=ns"
        );
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            write_url(&test_config("not a url")),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_posts_line_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, "204 No Content", String::new()));

        let (errors, mut rx) = error_channel(8);
        let mut sink = InfluxSink::new(&test_config(&format!("http://{}", addr)), errors).unwrap();
        sink.write_record("noise_sensor val=1.000000 1".to_string());
        sink.write_record("noise_sensor val=2.000000 2".to_string());
        sink.close().await;
        drop(sink);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/v2/write?org=yomo&bucket=noise&precision=ns"));
        assert!(request.to_ascii_lowercase().contains("authorization: token secret"));
        assert!(request.ends_with("noise_sensor val=1.000000 1\nnoise_sensor val=2.000000 2"));
        assert_eq!(rx.recv().await, None, "no errors on success");
    }

    #[tokio::test]
    async fn test_rejected_write_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            "404 Not Found",
            "bucket not found".to_string(),
        ));

        let (errors, mut rx) = error_channel(8);
        let mut sink = InfluxSink::new(&test_config(&format!("http://{}", addr)), errors).unwrap();
        sink.write_record("noise_sensor val=1.000000 1".to_string());
        sink.flush();
        sink.close().await;
        server.await.unwrap();

        let err = rx.recv().await.unwrap();
        assert_eq!(err.lines, 1);
        assert_eq!(
            err.kind,
            WriteErrorKind::Rejected {
                status: 404,
                body: "bucket not found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_transport_error_reported() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (errors, mut rx) = error_channel(8);
        let mut sink = InfluxSink::new(&test_config(&format!("http://{}", addr)), errors).unwrap();
        sink.write_record("noise_sensor val=1.000000 1".to_string());
        sink.close().await;

        let err = rx.recv().await.unwrap();
        assert!(matches!(err.kind, WriteErrorKind::Transport(_)));
    }

    #[tokio::test]
    async fn test_auto_flush_at_buffer_limit() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let config = InfluxConfig {
            max_buffered_lines: Some(2),
            ..test_config(&format!("http://{}", addr))
        };

        let (errors, _rx) = error_channel(8);
        let mut sink = InfluxSink::new(&config, errors).unwrap();
        sink.write_record("a 1".to_string());
        assert_eq!(sink.in_flight(), 0);
        sink.write_record("a 2".to_string());
        assert_eq!(sink.in_flight(), 1, "buffer limit triggers a flush");
        sink.close().await;
    }

    #[tokio::test]
    async fn test_long_multibyte_rejection_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // One ASCII byte then two-byte chars, so byte 512 lands mid-character
        let body = format!("x{}", "\u{e9}".repeat(400));
        let server = tokio::spawn(serve_once(listener, "400 Bad Request", body));

        let (errors, mut rx) = error_channel(8);
        let mut sink = InfluxSink::new(&test_config(&format!("http://{}", addr)), errors).unwrap();
        sink.write_record("noise_sensor val=1.000000 1".to_string());
        sink.close().await;
        server.await.unwrap();

        let err = rx.recv().await.expect("rejection reaches the error channel");
        match err.kind {
            WriteErrorKind::Rejected { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body.len(), ERROR_BODY_MAX - 1);
                assert!(body.starts_with("x\u{e9}"));
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        let mut ascii = "abcdef".to_string();
        truncate_on_char_boundary(&mut ascii, 4);
        assert_eq!(ascii, "abcd");

        let mut wide = "a\u{e9}\u{e9}".to_string();
        truncate_on_char_boundary(&mut wide, 2);
        assert_eq!(wide, "a");

        let mut short = "\u{e9}".to_string();
        truncate_on_char_boundary(&mut short, 512);
        assert_eq!(short, "\u{e9}");
    }
}
