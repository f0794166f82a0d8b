/// Audit logging for security-critical operations
///
/// Records every policy mutation and every privileged operation (batch
/// checks, loads, live reads) as one JSON object per line in
/// `<state dir>/audit.log`.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Initialize,
    AddUser,
    EditUser,
    RemoveUser,
    AddRule,
    RemoveRule,
    ValidatePolicy,
    ApplyPolicy,
    VerifyLive,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer; a disabled log accepts and drops every event.
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: Option<PathBuf>,
}

impl AuditLog {
    /// Opens the log in the XDG state directory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined.
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self::at(log_path))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: Some(path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { log_path: None }
    }

    /// Appends an event as one JSON line.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written.
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let Some(ref path) = self.log_path else {
            return Ok(());
        };

        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Records an event; failures to write are logged and otherwise ignored.
    pub async fn record(
        &self,
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        let event = AuditEvent::new(event_type, success, details, error);
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Reads up to `count` of the most recent events, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read.
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let Some(ref path) = self.log_path else {
            return Ok(Vec::new());
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect())
    }

    pub fn path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }
}

/// Logs a policy load
pub async fn log_apply(
    audit: &AuditLog,
    directives: usize,
    checksum: &str,
    success: bool,
    error: Option<String>,
) {
    audit
        .record(
            EventType::ApplyPolicy,
            success,
            serde_json::json!({
                "directives": directives,
                "checksum": checksum,
            }),
            error,
        )
        .await;
}

/// Logs a compile (and optional `--test`) run
pub async fn log_validate(audit: &AuditLog, success: bool, error_count: usize, error: Option<String>) {
    audit
        .record(
            EventType::ValidatePolicy,
            success,
            serde_json::json!({
                "error_count": error_count,
            }),
            error,
        )
        .await;
}

/// Logs a live-state comparison
pub async fn log_verify(audit: &AuditLog, in_sync: bool, error: Option<String>) {
    audit
        .record(
            EventType::VerifyLive,
            error.is_none(),
            serde_json::json!({
                "in_sync": in_sync,
            }),
            error,
        )
        .await;
}

/// Logs a successful change to the policy records
pub async fn log_change(audit: &AuditLog, event_type: EventType, details: serde_json::Value) {
    audit.record(event_type, true, details, None).await;
}
