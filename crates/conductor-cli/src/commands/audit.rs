//! `conductor audit`: inspect the audit log directory.

use conductor_core::audit::{AuditQuery, AuditReader, LogEvent};

use super::print_json;

/// Print the last records of the active session.
pub async fn tail(
    log_dir: &str,
    component: Option<String>,
    action: Option<String>,
    limit: usize,
    json: bool,
) -> Result<(), String> {
    let reader = AuditReader::new(log_dir);
    let events = reader
        .query(&AuditQuery {
            component,
            action,
            limit: Some(limit),
        })
        .await
        .map_err(|e| e.to_string())?;

    if events.is_empty() {
        println!("No audit records in {}", log_dir);
        return Ok(());
    }
    for event in &events {
        if json {
            print_json(&serde_json::to_value(event).map_err(|e| e.to_string())?);
        } else {
            println!("{}", format_event(event));
        }
    }
    Ok(())
}

/// List archive folders, or print the records of one.
pub async fn archives(log_dir: &str, show: Option<String>) -> Result<(), String> {
    let reader = AuditReader::new(log_dir);
    let dirs = reader.archives().await.map_err(|e| e.to_string())?;

    let Some(name) = show else {
        if dirs.is_empty() {
            println!("No archived sessions in {}", log_dir);
        }
        for dir in dirs {
            let count = reader
                .archived_events(&dir)
                .await
                .map(|events| events.len())
                .unwrap_or(0);
            let label = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            println!("{}  ({} record(s))", label, count);
        }
        return Ok(());
    };

    let dir = dirs
        .into_iter()
        .find(|d| d.file_name().map(|n| n.to_string_lossy() == name.as_str()).unwrap_or(false))
        .ok_or_else(|| format!("Archive '{}' not found in {}", name, log_dir))?;
    for event in reader.archived_events(&dir).await.map_err(|e| e.to_string())? {
        println!("{}", format_event(&event));
    }
    Ok(())
}

pub fn format_event(event: &LogEvent) -> String {
    format!(
        "{:>6} {} {:?} {}/{} {:?} {}",
        event.session_seq,
        event.timestamp.format("%H:%M:%S%.3f"),
        event.level,
        event.component,
        event.action,
        event.direction,
        event.details
    )
}
