pub mod session_store;
pub mod workflow_store;

pub use session_store::{ConversationTurn, SessionStore, TurnRole};
pub use workflow_store::{StoredWorkflow, WorkflowStore};
