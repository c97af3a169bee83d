use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::CoreError;
use crate::workflow::state::WorkflowState;

/// Row metadata for a persisted workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWorkflow {
    pub id: String,
    pub session_id: String,
    pub phase: String,
    pub updated_at: i64,
}

pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, state: &WorkflowState) -> Result<(), CoreError> {
        let json = serde_json::to_string(state)
            .map_err(|e| CoreError::Internal(format!("Failed to serialise workflow state: {}", e)))?;
        let id = state.workflow_id.clone();
        let session_id = state.session_id.clone();
        let phase = state.phase.as_str().to_string();
        let created_at = state.created_at.timestamp_millis();
        let updated_at = state.updated_at.timestamp_millis();

        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_states (id, session_id, phase, state, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                       session_id = excluded.session_id,
                       phase = excluded.phase,
                       state = excluded.state,
                       updated_at = excluded.updated_at",
                    rusqlite::params![id, session_id, phase, json, created_at, updated_at],
                )?;
                Ok(())
            })
            .await
    }

    /// `Ok(None)` for an unknown id; corrupt rows are an error.
    pub async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, CoreError> {
        let id = workflow_id.to_string();
        let raw: Option<String> = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT state FROM workflow_states WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                CoreError::Internal(format!(
                    "Stored state for workflow '{}' is unreadable: {}",
                    workflow_id, e
                ))
            }),
        }
    }

    /// Atomically move a paused workflow to `running`.
    ///
    /// Returns `false` when the row is missing or no longer paused, so only
    /// one of several concurrent resumers wins.
    pub async fn claim_paused(&self, workflow_id: &str) -> Result<bool, CoreError> {
        let id = workflow_id.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflow_states SET phase = 'running', updated_at = ?2
                     WHERE id = ?1 AND phase = 'paused'",
                    rusqlite::params![id, now],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    /// Paused workflows of a session, most recent first.
    pub async fn list_paused(&self, session_id: &str) -> Result<Vec<StoredWorkflow>, CoreError> {
        let sid = session_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, phase, updated_at FROM workflow_states
                     WHERE session_id = ?1 AND phase = 'paused'
                     ORDER BY updated_at DESC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![sid], row_to_stored)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_by_session(&self, session_id: &str) -> Result<Vec<StoredWorkflow>, CoreError> {
        let sid = session_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, phase, updated_at FROM workflow_states
                     WHERE session_id = ?1 ORDER BY created_at ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![sid], row_to_stored)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete(&self, workflow_id: &str) -> Result<(), CoreError> {
        let id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM workflow_states WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await
    }
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredWorkflow> {
    Ok(StoredWorkflow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        phase: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::{Plan, PlannedStep};
    use crate::workflow::state::WorkflowPhase;

    fn state(id: &str, session: &str) -> WorkflowState {
        let plan = Plan::from_steps("r", vec![PlannedStep::new("Worker_SNS", "g")]);
        WorkflowState::from_plan(id, session, "q", &plan, 8)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        let mut s = state("wf-1", "sess");
        store.save(&s).await.unwrap();

        s.set_phase(WorkflowPhase::Paused);
        s.pause_reason = Some("which region?".to_string());
        store.save(&s).await.unwrap();

        let loaded = store.load("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded, s);
        assert!(store.load("wf-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_paused() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        let mut paused = state("wf-p", "sess");
        paused.set_phase(WorkflowPhase::Paused);
        store.save(&paused).await.unwrap();
        store.save(&state("wf-r", "sess")).await.unwrap();
        store.save(&state("wf-o", "other")).await.unwrap();

        let ids: Vec<String> = store
            .list_paused("sess")
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec!["wf-p"]);
        assert_eq!(store.list_by_session("sess").await.unwrap().len(), 2);

        store.delete("wf-p").await.unwrap();
        assert!(store.list_paused("sess").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_paused_once() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        let mut paused = state("wf-c", "sess");
        paused.set_phase(WorkflowPhase::Paused);
        store.save(&paused).await.unwrap();
        store.save(&state("wf-r", "sess")).await.unwrap();

        assert!(store.claim_paused("wf-c").await.unwrap());
        assert!(!store.claim_paused("wf-c").await.unwrap());
        assert!(!store.claim_paused("wf-r").await.unwrap());
        assert!(!store.claim_paused("wf-missing").await.unwrap());
        assert!(store.list_paused("sess").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workflow_states (id, session_id, phase, state, created_at, updated_at)
                 VALUES ('wf-bad', 's', 'paused', '{not json', 0, 0)",
                [],
            )
        })
        .unwrap();
        let store = WorkflowStore::new(db);
        assert!(store.load("wf-bad").await.is_err());
    }
}
