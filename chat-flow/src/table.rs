//! In-memory table loaded from an uploaded CSV file, plus the small query
//! surface the reasoning agent drives through its tools.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The uploaded file exists but could not be turned into a table.
#[derive(Debug, Error)]
pub enum TableLoadError {
    #[error("failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed csv: {0}")]
    Parse(#[from] csv::Error),

    #[error("csv file has no header row")]
    MissingHeader,

    #[error("table loading was interrupted: {0}")]
    Interrupted(String),
}

/// A query against a loaded table could not be answered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("unknown column {0:?}")]
    UnknownColumn(String),

    #[error("column {0:?} has no numeric values")]
    NotNumeric(String),

    #[error("{0} requires a column")]
    MissingColumn(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Integer,
    Float,
    Boolean,
    Text,
    Empty,
}

impl ColumnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnKind::Integer => "integer",
            ColumnKind::Float => "float",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Text => "text",
            ColumnKind::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDescription {
    pub row_count: usize,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub column: String,
    pub kind: ColumnKind,
    pub count: usize,
    pub missing: usize,
    pub unique: usize,
    pub numeric: Option<NumericSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueCount {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    Count,
    Sum,
    Mean,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    /// Group key, `None` when aggregating the whole table.
    pub group: Option<String>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TableLoadError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| TableLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file)
    }

    /// Every record must have as many fields as the header row.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, TableLoadError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .trim(csv::Trim::Headers)
            .from_reader(reader);

        let headers = reader.headers()?.clone();
        if headers.is_empty() || headers.iter().all(str::is_empty) {
            return Err(TableLoadError::MissingHeader);
        }
        let columns = headers.iter().map(str::to_string).collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self { columns, rows })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn column_index(&self, name: &str) -> Result<usize, TableError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| TableError::UnknownColumn(name.to_string()))
    }

    fn column_values(&self, index: usize) -> impl Iterator<Item = &str> {
        self.rows.iter().map(move |row| row[index].as_str())
    }

    fn column_kind(&self, index: usize) -> ColumnKind {
        let mut kind = ColumnKind::Empty;
        for value in self.column_values(index).filter(|v| !is_missing(v)) {
            let value_kind = classify(value);
            kind = match (kind, value_kind) {
                (ColumnKind::Empty, k) => k,
                (k, v) if k == v => k,
                (ColumnKind::Integer, ColumnKind::Float) | (ColumnKind::Float, ColumnKind::Integer) => {
                    ColumnKind::Float
                }
                _ => return ColumnKind::Text,
            };
        }
        kind
    }

    pub fn describe(&self) -> TableDescription {
        TableDescription {
            row_count: self.rows.len(),
            columns: self
                .columns
                .iter()
                .enumerate()
                .map(|(index, name)| ColumnInfo {
                    name: name.clone(),
                    kind: self.column_kind(index),
                })
                .collect(),
        }
    }

    /// Rows as JSON objects keyed by column name.
    pub fn records(&self, offset: usize, limit: usize) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .skip(offset)
            .take(limit)
            .map(|row| self.record(row))
            .collect()
    }

    fn record(&self, row: &[String]) -> Map<String, Value> {
        self.columns
            .iter()
            .zip(row)
            .map(|(column, cell)| (column.clone(), cell_to_json(cell)))
            .collect()
    }

    pub fn column_stats(&self, column: &str) -> Result<ColumnStats, TableError> {
        let index = self.column_index(column)?;
        let present: Vec<&str> = self.column_values(index).filter(|v| !is_missing(v)).collect();
        let unique = present.iter().collect::<HashSet<_>>().len();
        let numbers: Vec<f64> = present.iter().filter_map(|v| parse_number(v)).collect();
        let kind = self.column_kind(index);

        let numeric = match kind {
            ColumnKind::Integer | ColumnKind::Float => summarize(&numbers),
            _ => None,
        };

        Ok(ColumnStats {
            column: column.to_string(),
            kind,
            count: present.len(),
            missing: self.rows.len() - present.len(),
            unique,
            numeric,
        })
    }

    /// Most frequent values first; ties are broken by value.
    pub fn value_counts(&self, column: &str, limit: usize) -> Result<Vec<ValueCount>, TableError> {
        let index = self.column_index(column)?;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for value in self.column_values(index) {
            *counts.entry(value).or_default() += 1;
        }

        let mut counts: Vec<ValueCount> = counts
            .into_iter()
            .map(|(value, count)| ValueCount {
                value: value.to_string(),
                count,
            })
            .collect();
        counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        counts.truncate(limit);
        Ok(counts)
    }

    /// Indices of the rows matching `filter`.
    pub fn filter(&self, filter: &RowFilter) -> Result<Vec<usize>, TableError> {
        let index = self.column_index(&filter.column)?;
        Ok(self
            .column_values(index)
            .enumerate()
            .filter(|(_, cell)| matches_filter(cell, filter.op, &filter.value))
            .map(|(row, _)| row)
            .collect())
    }

    pub fn records_at(&self, indices: &[usize], limit: usize) -> Vec<Map<String, Value>> {
        indices
            .iter()
            .filter_map(|&i| self.rows.get(i))
            .take(limit)
            .map(|row| self.record(row))
            .collect()
    }

    /// `Count` counts rows when `column` is absent, otherwise non-missing cells.
    /// Groups without numeric values yield `None` (zero for `Sum`).
    pub fn aggregate(
        &self,
        function: Aggregate,
        column: Option<&str>,
        group_by: Option<&str>,
    ) -> Result<Vec<AggregateRow>, TableError> {
        let value_index = column.map(|c| self.column_index(c)).transpose()?;
        let group_index = group_by.map(|c| self.column_index(c)).transpose()?;

        if function != Aggregate::Count {
            let index = value_index.ok_or(TableError::MissingColumn("aggregate"))?;
            if !self.column_values(index).any(|v| parse_number(v).is_some()) {
                return Err(TableError::NotNumeric(self.columns[index].clone()));
            }
        }

        let mut groups: BTreeMap<Option<String>, Vec<&[String]>> = BTreeMap::new();
        if group_index.is_none() {
            groups.insert(None, Vec::new());
        }
        for row in &self.rows {
            let key = group_index.map(|i| row[i].clone());
            groups.entry(key).or_default().push(row.as_slice());
        }

        Ok(groups
            .into_iter()
            .map(|(group, rows)| {
                let value = match value_index {
                    None => Some(rows.len() as f64),
                    Some(i) if function == Aggregate::Count => {
                        Some(rows.iter().filter(|row| !is_missing(&row[i])).count() as f64)
                    }
                    Some(i) => {
                        let numbers: Vec<f64> =
                            rows.iter().filter_map(|row| parse_number(&row[i])).collect();
                        match (function, summarize(&numbers)) {
                            (Aggregate::Sum, None) => Some(0.0),
                            (_, None) => None,
                            (Aggregate::Sum, Some(s)) => Some(s.sum),
                            (Aggregate::Mean, Some(s)) => Some(s.mean),
                            (Aggregate::Min, Some(s)) => Some(s.min),
                            (Aggregate::Max, Some(s)) => Some(s.max),
                            (Aggregate::Count, Some(_)) => Some(numbers.len() as f64),
                        }
                    }
                };
                AggregateRow { group, value }
            })
            .collect())
    }
}

fn is_missing(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.eq_ignore_ascii_case("nan") || value.eq_ignore_ascii_case("null")
}

fn parse_number(value: &str) -> Option<f64> {
    let parsed = value.trim().parse::<f64>().ok()?;
    parsed.is_finite().then_some(parsed)
}

fn classify(value: &str) -> ColumnKind {
    let value = value.trim();
    if value.parse::<i64>().is_ok() {
        ColumnKind::Integer
    } else if parse_number(value).is_some() {
        ColumnKind::Float
    } else if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
        ColumnKind::Boolean
    } else {
        ColumnKind::Text
    }
}

fn cell_to_json(cell: &str) -> Value {
    if is_missing(cell) {
        return Value::Null;
    }
    let trimmed = cell.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Some(f) = parse_number(trimmed) {
        return Value::from(f);
    }
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    Value::String(cell.to_string())
}

fn summarize(numbers: &[f64]) -> Option<NumericSummary> {
    if numbers.is_empty() {
        return None;
    }
    let sum: f64 = numbers.iter().sum();
    let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
    let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(NumericSummary {
        min,
        max,
        mean: sum / numbers.len() as f64,
        sum,
    })
}

fn matches_filter(cell: &str, op: FilterOp, expected: &str) -> bool {
    let compare = |accept: fn(Ordering) -> bool| {
        let ordering = match (parse_number(cell), parse_number(expected)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => Some(cell.trim().cmp(expected.trim())),
        };
        ordering.is_some_and(accept)
    };

    match op {
        FilterOp::Contains => cell.to_lowercase().contains(&expected.to_lowercase()),
        FilterOp::Eq => compare(Ordering::is_eq),
        FilterOp::Ne => compare(Ordering::is_ne),
        FilterOp::Gt => compare(Ordering::is_gt),
        FilterOp::Ge => compare(Ordering::is_ge),
        FilterOp::Lt => compare(Ordering::is_lt),
        FilterOp::Le => compare(Ordering::is_le),
    }
}
