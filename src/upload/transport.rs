//! Sinks for compressed upload batches.

use super::batch::CLIENT_VERSION;
use log::debug;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Accepts one compressed batch per call. Any error is retryable.
pub trait Transport: Send + Sync {
    fn send(&self, batch_id: Uuid, body: Vec<u8>) -> TransportFuture<'_>;
}

/// `PUT <server>/<client version>/<batch id>` with a gzip content tag.
pub struct HttpTransport {
    client: reqwest::Client,
    server_url: String,
}

impl HttpTransport {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(HttpTransport {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn request_url(&self, batch_id: Uuid) -> String {
        format!("{}/{}/{}", self.server_url, CLIENT_VERSION, batch_id)
    }
}

impl Transport for HttpTransport {
    fn send(&self, batch_id: Uuid, body: Vec<u8>) -> TransportFuture<'_> {
        Box::pin(async move {
            let url = self.request_url(batch_id);
            debug!("PUT {} ({} bytes)", url, body.len());
            let response = self
                .client
                .put(&url)
                .header("X-Metrics-Content-Encoding", "gzip")
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body)
                .send()
                .await
                .map_err(|e| format!("Failed to send batch: {}", e))?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(format!("Collector returned HTTP {}", status))
            }
        })
    }
}

/// In-memory transport that keeps every accepted body. Can be told to fail
/// a number of upcoming attempts.
#[derive(Default)]
pub struct MemoryTransport {
    accepted: Mutex<Vec<(Uuid, Vec<u8>)>>,
    failures_left: Mutex<usize>,
    attempts: Mutex<usize>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, attempts: usize) {
        *self.failures_left.lock() = attempts;
    }

    pub fn accepted(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.accepted.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, batch_id: Uuid, body: Vec<u8>) -> TransportFuture<'_> {
        Box::pin(async move {
            *self.attempts.lock() += 1;
            {
                let mut failures = self.failures_left.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err("Collector returned HTTP 503 Service Unavailable".to_string());
                }
            }
            self.accepted.lock().push((batch_id, body));
            Ok(())
        })
    }
}
