//! AuditReader: read audit records back from the log directory.
//!
//! Features:
//! - Read the active session stream or a single component stream
//! - List archive folders in rotation order
//! - Load an archive folder back into records, ordered by file name (= sequence)

use std::path::{Path, PathBuf};

use tokio::fs;

use super::types::LogEvent;
use super::writer::{AuditError, ARCHIVE_DIR_PREFIX, COMPONENT_LOG_DIR, SESSION_LOG_FILE};

/// Query parameters for filtering audit records.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Only records from this component
    pub component: Option<String>,
    /// Only records with this action
    pub action: Option<String>,
    /// Keep the last N matching records
    pub limit: Option<usize>,
}

/// Read-only view over an audit log directory.
#[derive(Clone)]
pub struct AuditReader {
    log_dir: PathBuf,
}

impl AuditReader {
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
        }
    }

    /// Records of the active session, in sequence order.
    pub async fn active_session(&self) -> Result<Vec<LogEvent>, AuditError> {
        read_jsonl(&self.log_dir.join(SESSION_LOG_FILE)).await
    }

    /// Active-session records matching the query.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<LogEvent>, AuditError> {
        let mut events: Vec<LogEvent> = self
            .active_session()
            .await?
            .into_iter()
            .filter(|e| {
                query.component.as_deref().map_or(true, |c| e.component == c)
                    && query.action.as_deref().map_or(true, |a| e.action == a)
            })
            .collect();

        if let Some(limit) = query.limit {
            if events.len() > limit {
                events.drain(..events.len() - limit);
            }
        }
        Ok(events)
    }

    /// All records ever mirrored for one component.
    pub async fn component(&self, component: &str) -> Result<Vec<LogEvent>, AuditError> {
        let path = self
            .log_dir
            .join(COMPONENT_LOG_DIR)
            .join(format!("{}.jsonl", super::types::sanitize_name(component)));
        read_jsonl(&path).await
    }

    /// Archive folders, oldest first.
    pub async fn archives(&self) -> Result<Vec<PathBuf>, AuditError> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.log_dir)
            .await
            .map_err(|e| AuditError::Io(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AuditError::Io(e.to_string()))?
        {
            let path = entry.path();
            let is_archive = entry
                .file_name()
                .to_string_lossy()
                .starts_with(ARCHIVE_DIR_PREFIX);
            if is_archive && path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Records of one archive folder, ordered by file name.
    pub async fn archived_events(&self, archive_dir: &Path) -> Result<Vec<LogEvent>, AuditError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(archive_dir)
            .await
            .map_err(|e| AuditError::Io(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AuditError::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();

        let mut events = Vec::with_capacity(files.len());
        for file in files {
            let content = fs::read_to_string(&file)
                .await
                .map_err(|e| AuditError::Io(format!("Failed to read {:?}: {}", file, e)))?;
            let event = serde_json::from_str(content.trim())
                .map_err(|e| AuditError::Serialization(format!("{:?}: {}", file, e)))?;
            events.push(event);
        }
        Ok(events)
    }
}

async fn read_jsonl(path: &Path) -> Result<Vec<LogEvent>, AuditError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| AuditError::Io(format!("Failed to read {:?}: {}", path, e)))?;

    let mut events = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<LogEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!("[AuditReader] Skipping unreadable record: {}", e),
        }
    }
    Ok(events)
}
