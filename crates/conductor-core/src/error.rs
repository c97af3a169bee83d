//! Core error types for the Conductor engine.
//!
//! `CoreError` is used by stores, configuration and the CLI glue. Errors that
//! belong to one boundary (dispatch, audit, planning) have their own enums next
//! to the code that raises them and convert into `CoreError` where they cross
//! into the host.

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<crate::audit::AuditError> for CoreError {
    fn from(err: crate::audit::AuditError) -> Self {
        CoreError::Internal(format!("audit log: {}", err))
    }
}

impl From<crate::workflow::schema::PlanError> for CoreError {
    fn from(err: crate::workflow::schema::PlanError) -> Self {
        CoreError::BadRequest(err.to_string())
    }
}
