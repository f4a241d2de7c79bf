use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::ChatTurn;
use crate::table::Table;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent provider failed: {0}")]
    Provider(String),

    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),

    #[error("agent call aborted: {0}")]
    Aborted(String),
}

/// Everything the agent needs to answer one question.
#[derive(Clone)]
pub struct AgentRequest {
    pub api_key: String,
    pub table: Arc<Table>,
    pub question: String,
    /// Completed, successful turns preceding this one, oldest first.
    pub history: Vec<ChatTurn>,
}

impl std::fmt::Debug for AgentRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRequest")
            .field("question", &self.question)
            .field("rows", &self.table.row_count())
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

/// Answers natural-language questions about a table.
///
/// Implementations are opaque to the turn runner: how they plan, which tools
/// they call and whether they retry is their own business.
#[async_trait]
pub trait TableAgent: Send + Sync {
    async fn answer(&self, request: AgentRequest) -> Result<String, AgentError>;
}
