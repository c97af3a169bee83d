//! Audit log: strictly sequenced, append-only record of every workflow transition.
//!
//! # Architecture
//!
//! - `LogEvent`: one audit record (`session_seq`, timestamp, component, action, direction, details)
//! - `AuditLog`: the writer; assigns `session_seq`, mirrors to per-component streams,
//!   archives the previous session on `start_session`
//! - `AuditReader`: reads the active stream, component streams and archive folders
//!
//! Storage layout under the log directory:
//!
//! ```text
//! log/
//! ├── session_log.jsonl                 active, sequenced stream
//! ├── system_events.jsonl               all-time mirror
//! ├── components/{component}.jsonl      per-component mirror
//! └── session_log_ex_0000000001/        one archive folder per rotated session
//!     └── 0000000001_workflow_executor_plan_accepted_20260101T120000_000000Z.json
//! ```

mod reader;
mod types;
mod writer;

pub use reader::*;
pub use types::*;
pub use writer::*;
