//! Table tools exposed to the LLM. Each tool is a thin, read-only view over
//! the session's loaded [`Table`].

use std::sync::Arc;

use chat_flow::Table;
use chat_flow::table::{
    Aggregate, AggregateRow, ColumnStats, FilterOp, RowFilter, TableDescription, TableError,
    ValueCount,
};
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Upper bound on rows returned by a single tool call.
pub const MAX_ROWS: usize = 50;

fn default_limit() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct NoArgs {}

#[derive(Debug, Deserialize)]
pub struct ColumnArgs {
    pub column: String,
}

pub struct DescribeTable {
    table: Arc<Table>,
}

impl DescribeTable {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }
}

impl Tool for DescribeTable {
    const NAME: &'static str = "describe_table";
    type Error = TableError;
    type Args = NoArgs;
    type Output = TableDescription;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Return the number of rows and the name and inferred type of every column."
                .to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn call(&self, _args: Self::Args) -> Result<Self::Output, Self::Error> {
        Ok(self.table.describe())
    }
}

#[derive(Debug, Deserialize)]
pub struct PreviewArgs {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

pub struct PreviewRows {
    table: Arc<Table>,
}

impl PreviewRows {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }
}

impl Tool for PreviewRows {
    const NAME: &'static str = "preview_rows";
    type Error = TableError;
    type Args = PreviewArgs;
    type Output = Vec<Map<String, Value>>;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: format!("Return rows as JSON objects, starting at `offset` (at most {MAX_ROWS})."),
            parameters: json!({
                "type": "object",
                "properties": {
                    "offset": { "type": "integer", "description": "Index of the first row, default 0" },
                    "limit": { "type": "integer", "description": "Number of rows, default 10" }
                }
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        Ok(self.table.records(args.offset, args.limit.min(MAX_ROWS)))
    }
}

pub struct ColumnStatsTool {
    table: Arc<Table>,
}

impl ColumnStatsTool {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }
}

impl Tool for ColumnStatsTool {
    const NAME: &'static str = "column_stats";
    type Error = TableError;
    type Args = ColumnArgs;
    type Output = ColumnStats;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Summarize one column: non-missing count, missing count, distinct values, and min/max/mean/sum for numeric columns.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "column": { "type": "string", "description": "Exact column name" }
                },
                "required": ["column"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        self.table.column_stats(&args.column)
    }
}

#[derive(Debug, Deserialize)]
pub struct ValueCountsArgs {
    pub column: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

pub struct ValueCounts {
    table: Arc<Table>,
}

impl ValueCounts {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }
}

impl Tool for ValueCounts {
    const NAME: &'static str = "value_counts";
    type Error = TableError;
    type Args = ValueCountsArgs;
    type Output = Vec<ValueCount>;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Count how often each value occurs in a column, most frequent first."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "column": { "type": "string", "description": "Exact column name" },
                    "limit": { "type": "integer", "description": "Number of values to return, default 10" }
                },
                "required": ["column"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        self.table.value_counts(&args.column, args.limit.min(MAX_ROWS))
    }
}

#[derive(Debug, Deserialize)]
pub struct FilterArgs {
    pub column: String,
    pub op: FilterOp,
    /// Models send numbers as JSON numbers; comparisons work on the text form.
    pub value: Value,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct FilterResult {
    pub matched: usize,
    pub rows: Vec<Map<String, Value>>,
}

pub struct FilterRows {
    table: Arc<Table>,
}

impl FilterRows {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }
}

impl Tool for FilterRows {
    const NAME: &'static str = "filter_rows";
    type Error = TableError;
    type Args = FilterArgs;
    type Output = FilterResult;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Select rows where `column` compares to `value`. Numbers compare numerically, text lexically; `contains` is a case-insensitive substring match. Returns the number of matches and the first matching rows.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "column": { "type": "string" },
                    "op": { "type": "string", "enum": ["eq", "ne", "gt", "ge", "lt", "le", "contains"] },
                    "value": { "type": ["string", "number", "boolean"] },
                    "limit": { "type": "integer", "description": "Rows to return, default 10" }
                },
                "required": ["column", "op", "value"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let value = match args.value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let matches = self.table.filter(&RowFilter {
            column: args.column,
            op: args.op,
            value,
        })?;
        Ok(FilterResult {
            matched: matches.len(),
            rows: self.table.records_at(&matches, args.limit.min(MAX_ROWS)),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct AggregateArgs {
    pub function: Aggregate,
    pub column: Option<String>,
    pub group_by: Option<String>,
}

pub struct AggregateTool {
    table: Arc<Table>,
}

impl AggregateTool {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }
}

impl Tool for AggregateTool {
    const NAME: &'static str = "aggregate";
    type Error = TableError;
    type Args = AggregateArgs;
    type Output = Vec<AggregateRow>;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Compute count, sum, mean, min or max of a column, optionally grouped by another column. `count` without a column counts rows.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "function": { "type": "string", "enum": ["count", "sum", "mean", "min", "max"] },
                    "column": { "type": "string", "description": "Column to aggregate" },
                    "group_by": { "type": "string", "description": "Optional column to group by" }
                },
                "required": ["function"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        self.table.aggregate(
            args.function,
            args.column.as_deref(),
            args.group_by.as_deref(),
        )
    }
}
