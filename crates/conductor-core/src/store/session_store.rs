use chrono::Utc;

use crate::db::Database;
use crate::error::CoreError;

/// Turns kept per session; older turns are dropped.
pub const MAX_TURNS: usize = 20;
/// Default number of user/assistant pairs rendered into history text.
pub const HISTORY_PAIRS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "assistant" => TurnRole::Assistant,
            _ => TurnRole::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
}

/// Bounded per-session conversation history.
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn add_user_turn(&self, session_id: &str, text: &str) -> Result<(), CoreError> {
        self.add_turn(session_id, TurnRole::User, text).await
    }

    pub async fn add_assistant_turn(&self, session_id: &str, text: &str) -> Result<(), CoreError> {
        self.add_turn(session_id, TurnRole::Assistant, text).await
    }

    async fn add_turn(&self, session_id: &str, role: TurnRole, text: &str) -> Result<(), CoreError> {
        let sid = session_id.to_string();
        let text = text.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO conversation_turns (session_id, role, text, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![sid, role.as_str(), text, now],
                )?;
                conn.execute(
                    "DELETE FROM conversation_turns WHERE session_id = ?1 AND id NOT IN (
                       SELECT id FROM conversation_turns WHERE session_id = ?1
                       ORDER BY id DESC LIMIT ?2
                     )",
                    rusqlite::params![sid, MAX_TURNS as i64],
                )?;
                Ok(())
            })
            .await
    }

    /// Stored turns, oldest first.
    pub async fn turns(&self, session_id: &str) -> Result<Vec<ConversationTurn>, CoreError> {
        let sid = session_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT role, text FROM conversation_turns WHERE session_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![sid], |row| {
                        let role: String = row.get(0)?;
                        Ok(ConversationTurn {
                            role: TurnRole::parse(&role),
                            text: row.get(1)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// The last `pairs` user/assistant pairs as `ROLE: text` lines.
    pub async fn history_as_text(&self, session_id: &str, pairs: usize) -> Result<String, CoreError> {
        let turns = self.turns(session_id).await?;
        let skip = turns.len().saturating_sub(pairs * 2);
        let lines: Vec<String> = turns
            .into_iter()
            .skip(skip)
            .filter(|t| !t.text.trim().is_empty())
            .map(|t| format!("{}: {}", t.role.as_str().to_uppercase(), t.text.trim()))
            .collect();
        Ok(lines.join("\n"))
    }

    pub async fn clear(&self, session_id: &str) -> Result<(), CoreError> {
        let sid = session_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM conversation_turns WHERE session_id = ?1",
                    rusqlite::params![sid],
                )?;
                Ok(())
            })
            .await
    }
}
