//! Downstream capability: deliver one chunk of quotes to storage.
//!
//! Storage failures are split in two. Transient ones (timeouts, connection
//! errors, 408, 429, 5xx) may be retried by the publisher. Permanent ones
//! (any other 4xx, an unreadable acknowledgement) may not.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http_client::{HttpClient, HttpRequest};
use crate::{encode_wire_batch, ErrorKind, Quote};

/// Path of the batch insert endpoint, relative to the storage base URL.
pub const BATCH_ENDPOINT_PATH: &str = "/v1/quotes/batch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Transient,
    Permanent,
}

/// Structured storage error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError {
    kind: StorageErrorKind,
    message: String,
    status: Option<u16>,
}

impl StorageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Transient,
            message: message.into(),
            status: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Permanent,
            message: message.into(),
            status: None,
        }
    }

    /// Classifies a non-2xx status: 408, 429 and 5xx are transient.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = if status == 408 || status == 429 || status >= 500 {
            StorageErrorKind::Transient
        } else {
            StorageErrorKind::Permanent
        };
        let mut snippet: String = body.chars().take(200).collect();
        if snippet.len() < body.len() {
            snippet.push_str("...");
        }
        Self {
            kind,
            message: format!("storage returned status {status}: {snippet}"),
            status: Some(status),
        }
    }

    pub const fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    pub const fn retryable(&self) -> bool {
        matches!(self.kind, StorageErrorKind::Transient)
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            StorageErrorKind::Transient => "storage.transient",
            StorageErrorKind::Permanent => "storage.permanent",
        }
    }

    pub const fn error_kind(&self) -> ErrorKind {
        match self.kind {
            StorageErrorKind::Transient => ErrorKind::Transient,
            StorageErrorKind::Permanent => ErrorKind::Permanent,
        }
    }
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for StorageError {}

/// Storage acknowledgement for one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertReport {
    #[serde(default)]
    pub inserted: u64,
    #[serde(default)]
    pub errors: u64,
}

/// Sends a chunk of at most `MAX_BATCH` quotes to storage.
pub trait StorageSink: Send + Sync {
    fn send_to_storage<'a>(
        &'a self,
        chunk: &'a [Quote],
    ) -> Pin<Box<dyn Future<Output = Result<InsertReport, StorageError>> + Send + 'a>>;
}

/// JSON-over-HTTP sink posting `{"quotes": [...]}` to the batch endpoint.
#[derive(Clone)]
pub struct HttpStorageSink {
    http_client: Arc<dyn HttpClient>,
    endpoint: String,
    timeout: Duration,
}

impl std::fmt::Debug for HttpStorageSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStorageSink")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpStorageSink {
    pub fn new(http_client: Arc<dyn HttpClient>, storage_url: &str, timeout: Duration) -> Self {
        Self {
            http_client,
            endpoint: format!("{}{BATCH_ENDPOINT_PATH}", storage_url.trim_end_matches('/')),
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl StorageSink for HttpStorageSink {
    fn send_to_storage<'a>(
        &'a self,
        chunk: &'a [Quote],
    ) -> Pin<Box<dyn Future<Output = Result<InsertReport, StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let body = encode_wire_batch(chunk)
                .map_err(|e| StorageError::permanent(format!("failed to encode batch: {e}")))?;

            debug!(quotes = chunk.len(), endpoint = %self.endpoint, "posting batch to storage");
            let request = HttpRequest::post_json(&self.endpoint, body).with_timeout(self.timeout);

            let response = self.http_client.execute(request).await.map_err(|e| {
                if e.retryable() {
                    StorageError::transient(format!("storage transport error: {}", e.message()))
                } else {
                    StorageError::permanent(format!("storage transport error: {}", e.message()))
                }
            })?;

            if !response.is_success() {
                return Err(StorageError::from_status(response.status, &response.body));
            }

            serde_json::from_str::<InsertReport>(&response.body).map_err(|e| {
                StorageError::permanent(format!("unreadable storage acknowledgement: {e}"))
            })
        })
    }
}
