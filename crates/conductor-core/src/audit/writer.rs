//! AuditLog: sequenced JSONL writer with archive-on-start rotation.
//!
//! Features:
//! - One async mutex serialises sequence assignment, writes and rotation,
//!   so `session_seq` values are gap-free and in emission order
//! - Every record is mirrored to `system_events.jsonl` and `components/{component}.jsonl`
//! - `start_session(true)` splits the previous active stream into one file per
//!   record inside a fresh `session_log_ex_{n}` folder, then resets the stream

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::types::{
    compact_timestamp, normalize_details, sanitize_name, AuditLevel, Direction, LogEvent,
};

/// Active, sequenced stream.
pub const SESSION_LOG_FILE: &str = "session_log.jsonl";
/// All-time mirror of every record.
pub const SYSTEM_LOG_FILE: &str = "system_events.jsonl";
/// Directory holding one stream per component.
pub const COMPONENT_LOG_DIR: &str = "components";
/// Prefix of numbered archive folders.
pub const ARCHIVE_DIR_PREFIX: &str = "session_log_ex_";

/// Rotation state of the active stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    /// Accepting records
    Active,
    /// Splitting the previous session into the archive; no writes allowed
    Archiving,
}

/// Outcome of [`AuditLog::start_session`].
#[derive(Debug, Clone)]
pub struct SessionStart {
    /// Identifier of the new logging session
    pub session_id: String,
    /// Archive folder written for the previous session, if it had content
    pub archive_dir: Option<PathBuf>,
    /// Number of records moved into the archive
    pub archived_records: usize,
}

struct AuditState {
    phase: RotationPhase,
    /// Last assigned sequence number (0 = nothing written this session)
    last_seq: u64,
    session_id: String,
}

/// Append-only audit log. Cheap to clone; clones share the same sequence.
#[derive(Clone)]
pub struct AuditLog {
    log_dir: PathBuf,
    state: Arc<Mutex<AuditState>>,
}

impl AuditLog {
    /// Open (or create) the audit log in `log_dir`.
    ///
    /// If an active stream already exists the sequence continues after its
    /// highest `session_seq`; call [`start_session`](Self::start_session) to
    /// archive it and restart at 1.
    pub async fn open(log_dir: impl AsRef<Path>) -> Result<Self, AuditError> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(log_dir.join(COMPONENT_LOG_DIR))
            .await
            .map_err(|e| AuditError::Io(format!("Failed to create log dir: {}", e)))?;

        let last_seq = last_sequence_in(&log_dir.join(SESSION_LOG_FILE)).await?;

        Ok(Self {
            log_dir,
            state: Arc::new(Mutex::new(AuditState {
                phase: RotationPhase::Active,
                last_seq,
                session_id: compact_timestamp(&Utc::now()),
            })),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn session_log_path(&self) -> PathBuf {
        self.log_dir.join(SESSION_LOG_FILE)
    }

    pub async fn session_id(&self) -> String {
        self.state.lock().await.session_id.clone()
    }

    pub async fn phase(&self) -> RotationPhase {
        self.state.lock().await.phase
    }

    /// Start a new logging session.
    ///
    /// With `reset = true` the previous active stream (if non-empty) is split
    /// record-by-record into a new archive folder, then the stream and the
    /// sequence counter are reinitialised. Holds the writer lock throughout,
    /// so no record can interleave with the rotation.
    pub async fn start_session(&self, reset: bool) -> Result<SessionStart, AuditError> {
        let mut state = self.state.lock().await;
        let session_id = compact_timestamp(&Utc::now());

        if !reset {
            state.session_id = session_id.clone();
            return Ok(SessionStart {
                session_id,
                archive_dir: None,
                archived_records: 0,
            });
        }

        state.phase = RotationPhase::Archiving;
        let rotated = self.rotate_active_stream().await;
        // Writes resume after a failed rotation; the sequence is kept.
        state.phase = RotationPhase::Active;
        let (archive_dir, archived_records) = rotated?;

        state.last_seq = 0;
        state.session_id = session_id.clone();

        tracing::info!(
            "[AuditLog] Started session {} (archived {} record(s))",
            session_id,
            archived_records
        );

        Ok(SessionStart {
            session_id,
            archive_dir,
            archived_records,
        })
    }

    /// Record an INFO event. Returns the written record with its `session_seq`.
    pub async fn record(
        &self,
        component: &str,
        action: &str,
        direction: Direction,
        details: Value,
    ) -> Result<LogEvent, AuditError> {
        self.record_with_level(AuditLevel::Info, component, action, direction, details)
            .await
    }

    /// Record an event with an explicit level.
    ///
    /// The sequence number is only consumed once the active stream write
    /// succeeds; mirror failures are logged and do not affect the sequence.
    pub async fn record_with_level(
        &self,
        level: AuditLevel,
        component: &str,
        action: &str,
        direction: Direction,
        details: Value,
    ) -> Result<LogEvent, AuditError> {
        let mut state = self.state.lock().await;
        if state.phase != RotationPhase::Active {
            return Err(AuditError::Rotating);
        }

        let event = LogEvent {
            session_seq: state.last_seq + 1,
            timestamp: Utc::now(),
            level,
            component: sanitize_name(component),
            action: sanitize_name(action),
            direction,
            details: normalize_details(details),
        };

        let line = serde_json::to_string(&event)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;

        append_line(&self.session_log_path(), &line).await?;
        state.last_seq = event.session_seq;

        let component_file = self
            .log_dir
            .join(COMPONENT_LOG_DIR)
            .join(format!("{}.jsonl", event.component));
        for mirror in [self.log_dir.join(SYSTEM_LOG_FILE), component_file] {
            if let Err(e) = append_line(&mirror, &line).await {
                tracing::warn!("[AuditLog] Failed to mirror record to {:?}: {}", mirror, e);
            }
        }

        Ok(event)
    }

    /// Record an event, logging errors but never failing.
    ///
    /// Use this on workflow paths where an audit failure must not change the
    /// outcome of the workflow.
    pub async fn record_safe(
        &self,
        level: AuditLevel,
        component: &str,
        action: &str,
        direction: Direction,
        details: Value,
    ) -> Option<u64> {
        match self
            .record_with_level(level, component, action, direction, details)
            .await
        {
            Ok(event) => Some(event.session_seq),
            Err(e) => {
                tracing::warn!("[AuditLog] Failed to record {}/{}: {}", component, action, e);
                None
            }
        }
    }

    /// Split the active stream into an archive folder. Caller holds the lock.
    async fn rotate_active_stream(&self) -> Result<(Option<PathBuf>, usize), AuditError> {
        let archived = self.archive_active_stream().await?;
        fs::write(self.session_log_path(), b"")
            .await
            .map_err(|e| AuditError::Io(format!("Failed to reset session log: {}", e)))?;
        Ok(archived)
    }

    async fn archive_active_stream(&self) -> Result<(Option<PathBuf>, usize), AuditError> {
        let path = self.session_log_path();
        if !path.exists() {
            return Ok((None, 0));
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| AuditError::Io(format!("Failed to read session log: {}", e)))?;
        let lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if lines.is_empty() {
            return Ok((None, 0));
        }

        let archive_dir = self.next_archive_dir().await?;
        fs::create_dir_all(&archive_dir)
            .await
            .map_err(|e| AuditError::Io(format!("Failed to create archive dir: {}", e)))?;

        for (idx, line) in lines.iter().enumerate() {
            let fallback_seq = idx as u64 + 1;
            let (file_name, body) = archive_entry(line, fallback_seq)?;
            let target = unique_path(&archive_dir, &file_name);
            fs::write(&target, format!("{}\n", body))
                .await
                .map_err(|e| AuditError::Io(format!("Failed to write {:?}: {}", target, e)))?;
        }

        Ok((Some(archive_dir), lines.len()))
    }

    async fn next_archive_dir(&self) -> Result<PathBuf, AuditError> {
        let mut max_seq = 0u64;
        let mut entries = fs::read_dir(&self.log_dir)
            .await
            .map_err(|e| AuditError::Io(format!("Failed to list log dir: {}", e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AuditError::Io(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(suffix) = name.strip_prefix(ARCHIVE_DIR_PREFIX) {
                if let Ok(n) = suffix.parse::<u64>() {
                    max_seq = max_seq.max(n);
                }
            }
        }
        Ok(self
            .log_dir
            .join(format!("{}{:010}", ARCHIVE_DIR_PREFIX, max_seq + 1)))
    }
}

/// Build the archive file name and body for one active-stream line.
///
/// Valid records are written verbatim; unparseable lines are wrapped in an
/// `invalid_session_jsonl_line` record so nothing is dropped.
fn archive_entry(line: &str, fallback_seq: u64) -> Result<(String, String), AuditError> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => {
            let seq = map
                .get("session_seq")
                .and_then(Value::as_u64)
                .unwrap_or(fallback_seq);
            let component = map
                .get("component")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let action = map.get("action").and_then(Value::as_str).unwrap_or("event");
            let ts = map
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            let name = format!(
                "{:010}_{}_{}_{}.json",
                seq,
                sanitize_name(component),
                sanitize_name(action),
                compact_timestamp(&ts)
            );
            Ok((name, line.to_string()))
        }
        _ => {
            let wrapped = LogEvent {
                session_seq: fallback_seq,
                timestamp: Utc::now(),
                level: AuditLevel::Error,
                component: "audit".to_string(),
                action: "invalid_session_jsonl_line".to_string(),
                direction: Direction::Internal,
                details: normalize_details(serde_json::json!({ "line": line })),
            };
            let body = serde_json::to_string(&wrapped)
                .map_err(|e| AuditError::Serialization(e.to_string()))?;
            Ok((wrapped.archive_file_name(), body))
        }
    }
}

fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = file_name.trim_end_matches(".json");
    let mut suffix = 1;
    loop {
        let candidate = dir.join(format!("{}_{}.json", stem, suffix));
        if !candidate.exists() {
            return candidate;
        }
        suffix += 1;
    }
}

async fn append_line(path: &Path, line: &str) -> Result<(), AuditError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| AuditError::Io(e.to_string()))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| AuditError::Io(e.to_string()))?;
    file.write_all(b"\n")
        .await
        .map_err(|e| AuditError::Io(e.to_string()))?;
    file.flush().await.map_err(|e| AuditError::Io(e.to_string()))?;
    Ok(())
}

async fn last_sequence_in(path: &Path) -> Result<u64, AuditError> {
    if !path.exists() {
        return Ok(0);
    }
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| AuditError::Io(format!("Failed to read session log: {}", e)))?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|value| value.get("session_seq").and_then(Value::as_u64))
        .max()
        .unwrap_or(0))
}

/// Error type for audit log operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Audit log is rotating")]
    Rotating,
}
