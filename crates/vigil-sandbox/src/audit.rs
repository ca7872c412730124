//! Audit logging for script evaluations.
//!
//! Every evaluation emits an [`AuditEntry`] containing:
//! - Evaluation ID (UUID)
//! - SHA-256 hash of the script (never the raw source in logs)
//! - A redacted preview of the first 500 bytes of the script
//! - HTTP calls made (with hashed URLs, not raw)
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;
use vigil_error::TransportError;

use crate::error::EvaluationError;
use crate::http::{HttpRequest, RawHttpResponse};
use crate::script::AuditResult;
use crate::HttpTransport;

/// Maximum length of the source preview in audit entries.
const SOURCE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique evaluation identifier.
    pub evaluation_id: String,
    /// When the evaluation started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the script source.
    pub source_hash: String,
    /// First bytes of the source, redacted.
    pub source_preview: String,
    /// Whether a remote peer drove the evaluation.
    pub mode: EvaluationMode,
    /// HTTP calls made during the evaluation.
    pub http_calls: Vec<HttpCallAudit>,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// How the evaluation's `Input`/`Output` were driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// No-op context, fire and forget.
    Batch,
    /// Session-backed context.
    Interactive,
}

/// Audit record for one HTTP call.
#[derive(Debug, Clone, Serialize)]
pub struct HttpCallAudit {
    /// Request method.
    pub method: String,
    /// SHA-256 hash of the URL (URLs may carry credentials).
    pub url_hash: String,
    /// Response status, when a response arrived.
    pub status: Option<u16>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Whether a response arrived.
    pub success: bool,
}

/// The outcome of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum AuditOutcome {
    /// The script returned an `AuditResult`.
    Completed {
        /// `successful`, `failed` or `aborted`.
        result: String,
    },
    /// The evaluation failed.
    Error {
        /// Stable error code.
        code: String,
        /// Redacted message.
        message: String,
    },
    /// The watchdog stopped the script.
    Timeout,
    /// The session went away or a prompt expired.
    Cancelled,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    Sha256::digest(data.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// First [`SOURCE_PREVIEW_MAX`] bytes of `source`, cut on a char boundary.
pub fn source_preview(source: &str) -> String {
    if source.len() <= SOURCE_PREVIEW_MAX {
        return source.to_string();
    }
    let mut end = SOURCE_PREVIEW_MAX;
    while !source.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &source[..end])
}

/// Builder for constructing audit entries during an evaluation.
pub struct AuditEntryBuilder {
    evaluation_id: String,
    timestamp: DateTime<Utc>,
    source_hash: String,
    source_preview: String,
    mode: EvaluationMode,
    http_calls: Vec<HttpCallAudit>,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an entry for `source`.
    pub fn new(source: &str, mode: EvaluationMode) -> Self {
        Self {
            evaluation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source_hash: sha256_hex(source),
            source_preview: crate::redact::redact_error_message(&source_preview(source)),
            mode,
            http_calls: Vec::new(),
            start: Instant::now(),
        }
    }

    /// The evaluation ID this entry will carry.
    pub fn evaluation_id(&self) -> &str {
        &self.evaluation_id
    }

    /// Record an HTTP call.
    pub fn record_http_call(&mut self, audit: HttpCallAudit) {
        self.http_calls.push(audit);
    }

    /// Finalize the entry with the evaluation result.
    pub fn finish(self, result: &Result<AuditResult, EvaluationError>) -> AuditEntry {
        let outcome = match result {
            Ok(audit_result) => AuditOutcome::Completed {
                result: audit_result.label().to_string(),
            },
            Err(EvaluationError::Timeout { .. }) => AuditOutcome::Timeout,
            Err(EvaluationError::Cancelled | EvaluationError::PromptTimeout { .. }) => {
                AuditOutcome::Cancelled
            }
            Err(e) => AuditOutcome::Error {
                code: e.code().to_string(),
                message: crate::redact::redact_error_message(&e.to_string()),
            },
        };

        AuditEntry {
            evaluation_id: self.evaluation_id,
            timestamp: self.timestamp,
            source_hash: self.source_hash,
            source_preview: self.source_preview,
            mode: self.mode,
            http_calls: self.http_calls,
            duration_ms: self.start.elapsed().as_millis() as u64,
            outcome,
        }
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via [`tracing`].
///
/// Entries are logged at `INFO` with `audit = true`. HTTP calls are
/// summarised as a count.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let outcome = match &entry.outcome {
            AuditOutcome::Completed { result } => result.as_str(),
            AuditOutcome::Error { code, .. } => code.as_str(),
            AuditOutcome::Timeout => "timeout",
            AuditOutcome::Cancelled => "cancelled",
        };
        tracing::info!(
            audit = true,
            evaluation_id = %entry.evaluation_id,
            mode = ?entry.mode,
            source_hash = %entry.source_hash,
            duration_ms = entry.duration_ms,
            http_calls = entry.http_calls.len(),
            outcome = outcome,
            "audit"
        );
    }
}

/// An [`HttpTransport`] wrapper that reports every call on a channel.
///
/// The sender is non-blocking, so it is safe to use from the evaluation
/// thread.
pub struct AuditingTransport {
    inner: Arc<dyn HttpTransport>,
    audit_tx: tokio::sync::mpsc::UnboundedSender<HttpCallAudit>,
}

impl AuditingTransport {
    /// Wrap a transport with audit recording.
    pub fn new(
        inner: Arc<dyn HttpTransport>,
        audit_tx: tokio::sync::mpsc::UnboundedSender<HttpCallAudit>,
    ) -> Self {
        Self { inner, audit_tx }
    }
}

impl HttpTransport for AuditingTransport {
    fn send(&self, request: &HttpRequest) -> Result<RawHttpResponse, TransportError> {
        let start = Instant::now();
        let result = self.inner.send(request);

        let audit = HttpCallAudit {
            method: request.method.clone(),
            url_hash: sha256_hex(&request.url),
            status: result.as_ref().ok().map(|r| r.status),
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.is_ok(),
        };
        let _ = self.audit_tx.send(audit);

        result
    }
}
