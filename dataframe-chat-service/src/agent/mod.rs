pub mod history;
pub mod tools;

use async_trait::async_trait;
use chat_flow::{AgentError, AgentRequest, Table, TableAgent};
use rig::agent::AgentBuilder;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt};
use rig::providers::{openai, openrouter};
use tracing::info;

use crate::config::{LlmProvider, ServiceConfig};

use self::history::to_rig_messages;
use self::tools::{AggregateTool, ColumnStatsTool, DescribeTable, FilterRows, PreviewRows, ValueCounts};

const TABLE_AGENT_PROMPT: &str = r#"You are a data analyst answering questions about a single table that the user uploaded as a CSV file.
Use the tools to inspect the table before answering; never guess values you have not looked up.
Column names are case-sensitive and must be passed to the tools exactly as listed below.
Answer in plain language, concisely. If the table cannot answer the question, say so."#;

/// Rows shown to the model up front, like a dataframe `head()`.
const PREVIEW_ROWS: usize = 5;

/// Reasoning agent backed by rig, built per turn from the session credential.
#[derive(Debug, Clone)]
pub struct RigTableAgent {
    provider: LlmProvider,
    model: String,
    max_turns: usize,
}

impl RigTableAgent {
    pub fn new(provider: LlmProvider, model: impl Into<String>, max_turns: usize) -> Self {
        Self {
            provider,
            model: model.into(),
            max_turns,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.provider, config.model.clone(), config.agent_max_turns)
    }
}

#[async_trait]
impl TableAgent for RigTableAgent {
    async fn answer(&self, request: AgentRequest) -> Result<String, AgentError> {
        info!(
            provider = ?self.provider,
            model = %self.model,
            rows = request.table.row_count(),
            history = request.history.len(),
            "invoking table agent"
        );

        let answer = match self.provider {
            LlmProvider::OpenAi => {
                let client = openai::Client::new(&request.api_key);
                prompt_table_agent(client.agent(&self.model), &request, self.max_turns).await
            }
            LlmProvider::OpenRouter => {
                let client = openrouter::Client::new(&request.api_key);
                prompt_table_agent(client.agent(&self.model), &request, self.max_turns).await
            }
        };

        answer.map_err(|e| AgentError::Provider(e.to_string()))
    }
}

async fn prompt_table_agent<M>(
    builder: AgentBuilder<M>,
    request: &AgentRequest,
    max_turns: usize,
) -> anyhow::Result<String>
where
    M: CompletionModel + 'static,
{
    let table = &request.table;
    let agent = builder
        .preamble(&build_preamble(table))
        .temperature(0.0)
        .tool(DescribeTable::new(table.clone()))
        .tool(PreviewRows::new(table.clone()))
        .tool(ColumnStatsTool::new(table.clone()))
        .tool(ValueCounts::new(table.clone()))
        .tool(FilterRows::new(table.clone()))
        .tool(AggregateTool::new(table.clone()))
        .build();

    let mut history = to_rig_messages(&request.history);
    let answer = agent
        .prompt(request.question.as_str())
        .with_history(&mut history)
        .multi_turn(max_turns)
        .await?;

    Ok(answer)
}

fn build_preamble(table: &Table) -> String {
    let description = table.describe();
    let columns = description
        .columns
        .iter()
        .map(|c| format!("- {} ({})", c.name, c.kind.as_str()))
        .collect::<Vec<_>>()
        .join("\n");
    let preview = serde_json::to_string_pretty(&table.records(0, PREVIEW_ROWS))
        .unwrap_or_else(|_| "[]".to_string());

    format!(
        "{TABLE_AGENT_PROMPT}\n\nThe table has {} rows and these columns:\n{columns}\n\nFirst rows:\n{preview}",
        description.row_count
    )
}
