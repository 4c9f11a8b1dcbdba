//! Append-only audit log of security-relevant events.
//!
//! Event construction rejects sensitive metadata keys outright, so a secret
//! can never reach any storage backend. Storage is pluggable; the bundled
//! file sink writes JSON lines with size-based rotation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

/// Substrings (case-insensitive) that disqualify a metadata key.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "token",
    "password",
    "secret",
    "api_key",
    "private_key",
    "access_token",
    "refresh_token",
    "jwt",
    "credential",
    "ssn",
    "credit_card",
    "cvv",
];

const AUDIT_LOG_FILE: &str = "security_audit.log";
const MAX_QUERY_CACHE: usize = 10_000;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("metadata contains sensitive key '{key}'; never log tokens, passwords, or PII")]
    SensitiveMetadataKey { key: String },
    #[error("audit storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    AuthenticationSuccess,
    AuthenticationFailure,
    AuthorizationSuccess,
    AuthorizationFailure,
    TokenIssued,
    TokenRenewed,
    TokenRevoked,
    SignatureVerified,
    SignatureFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
    Verified,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventKind,
    pub peer_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub result: AuditResult,
    pub reason: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AuditEvent {
    /// Build an event, rejecting any metadata key whose lowercased form
    /// contains a sensitive fragment.
    pub fn new(
        event_type: AuditEventKind,
        peer_id: impl Into<String>,
        action: impl Into<String>,
        resource: Option<String>,
        result: AuditResult,
        reason: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<Self, AuditError> {
        for key in metadata.keys() {
            let lowered = key.to_lowercase();
            if SENSITIVE_KEY_FRAGMENTS.iter().any(|frag| lowered.contains(frag)) {
                return Err(AuditError::SensitiveMetadataKey { key: key.clone() });
            }
        }

        Ok(Self {
            timestamp: Utc::now(),
            event_type,
            peer_id: peer_id.into(),
            action: action.into(),
            resource,
            result,
            reason: reason.into(),
            metadata,
        })
    }
}

/// Query filters; all optional, AND-combined.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub peer_id: Option<String>,
    pub event_type: Option<AuditEventKind>,
    pub result: Option<AuditResult>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[async_trait]
pub trait AuditStorage: Send + Sync {
    async fn store(&self, event: &AuditEvent) -> anyhow::Result<()>;
    async fn query(&self, query: &AuditQuery) -> anyhow::Result<Vec<AuditEvent>>;
}

struct FileState {
    /// Recent events kept for queries; the files are the durable record.
    cache: Vec<AuditEvent>,
}

/// JSON-lines audit log with size-based rotation
/// (`security_audit.log` -> `.1` -> `.2` ... up to `backup_count`).
pub struct FileAuditLog {
    log_dir: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    state: Mutex<FileState>,
}

impl FileAuditLog {
    pub fn new(
        log_dir: impl Into<PathBuf>,
        max_bytes: u64,
        backup_count: usize,
    ) -> std::io::Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self {
            log_dir,
            max_bytes,
            backup_count,
            state: Mutex::new(FileState { cache: Vec::new() }),
        })
    }

    fn log_path(&self) -> PathBuf {
        self.log_dir.join(AUDIT_LOG_FILE)
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = self.log_path();

        let current_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if current_len + line.len() as u64 + 1 > self.max_bytes && current_len > 0 {
            self.rotate()?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn rotate(&self) -> std::io::Result<()> {
        if self.backup_count == 0 {
            return std::fs::remove_file(self.log_path());
        }

        let backup = |n: usize| self.log_dir.join(format!("{AUDIT_LOG_FILE}.{n}"));
        let _ = std::fs::remove_file(backup(self.backup_count));
        for n in (1..self.backup_count).rev() {
            if backup(n).exists() {
                std::fs::rename(backup(n), backup(n + 1))?;
            }
        }
        std::fs::rename(self.log_path(), backup(1))
    }
}

#[async_trait]
impl AuditStorage for FileAuditLog {
    async fn store(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;

        let mut state = self.state.lock().expect("audit log lock poisoned");
        self.append_line(&line)?;
        state.cache.push(event.clone());
        if state.cache.len() > MAX_QUERY_CACHE {
            state.cache.remove(0);
        }
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> anyhow::Result<Vec<AuditEvent>> {
        let mut results: Vec<AuditEvent> = {
            let state = self.state.lock().expect("audit log lock poisoned");
            state.cache.clone()
        };

        results.retain(|e| {
            query.peer_id.as_ref().is_none_or(|p| &e.peer_id == p)
                && query.event_type.is_none_or(|t| e.event_type == t)
                && query.result.is_none_or(|r| e.result == r)
                && query.start_time.is_none_or(|s| e.timestamp >= s)
                && query.end_time.is_none_or(|u| e.timestamp <= u)
        });
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let offset = query.offset.unwrap_or(0).min(results.len());
        let limit = query.limit.unwrap_or(100);
        Ok(results.into_iter().skip(offset).take(limit).collect())
    }
}

/// Thin front over a storage backend. `log` is the write path used by the
/// rest of the control plane.
pub struct AuditLogger {
    storage: std::sync::Arc<dyn AuditStorage>,
}

impl AuditLogger {
    pub fn new(storage: std::sync::Arc<dyn AuditStorage>) -> Self {
        Self { storage }
    }

    pub async fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.storage.store(&event).await?;
        Ok(())
    }

    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self.storage.query(query).await?)
    }
}
