//! Externally captured tool invocation records (one JSON object per line).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::time::deserialize_lenient;

const JSON_RESULT_LIMIT: usize = 1000;
const TEXT_RESULT_LIMIT: usize = 500;

/// Outcome of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// One logged tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolLogRecord {
    #[serde(deserialize_with = "deserialize_lenient")]
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub params: Map<String, Value>,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ToolLogRecord {
    fn icon(&self) -> &'static str {
        match self.status {
            ToolStatus::Success => "✓",
            ToolStatus::Error => "✗",
        }
    }

    /// Single-line form used where a block would break the surrounding
    /// table row or code block.
    pub fn to_inline(&self) -> String {
        format!("{} Tool: {}", self.icon(), self.tool)
    }

    /// Formats the record as the Markdown block that replaces a placeholder.
    pub fn to_markdown(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("**{} Tool: `{}`**", self.icon(), self.tool));

        if !self.params.is_empty() {
            lines.push("\n**Parameters:**".to_string());
            lines.push(format!("```json\n{}\n```", pretty(&Value::Object(self.params.clone()))));
        }

        match (self.status, &self.result, &self.error) {
            (ToolStatus::Success, Some(result), _) if !result.is_null() => {
                lines.push("\n**Result:**".to_string());
                lines.push(format_result(result));
            }
            (ToolStatus::Error, _, Some(error)) => {
                lines.push(format!("\n**Error:** `{error}`"));
            }
            _ => {}
        }

        if let Some(ms) = self.execution_time_ms {
            lines.push(format!("\n*Execution time: {ms}ms*"));
        }

        lines.join("\n")
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn format_result(result: &Value) -> String {
    let truncated = result
        .get("_truncated")
        .is_some_and(|flag| flag.as_bool().unwrap_or(!flag.is_null()));
    if truncated {
        let preview = result.get("preview").and_then(Value::as_str).unwrap_or("");
        return format!("```\n{preview}...\n[truncated]\n```");
    }

    match result {
        Value::Object(_) | Value::Array(_) => {
            let mut json = pretty(result);
            if let Some(cut) = char_boundary(&json, JSON_RESULT_LIMIT) {
                json.truncate(cut);
                json.push_str("\n...\n[truncated for display]");
            }
            format!("```json\n{json}\n```")
        }
        other => {
            let mut text = match other {
                Value::String(s) => s.clone(),
                scalar => scalar.to_string(),
            };
            if let Some(cut) = char_boundary(&text, TEXT_RESULT_LIMIT) {
                text.truncate(cut);
                text.push_str("...");
            }
            format!("```\n{text}\n```")
        }
    }
}

/// Byte offset of the `limit`-th character, if the string is longer than that.
fn char_boundary(s: &str, limit: usize) -> Option<usize> {
    s.char_indices().nth(limit).map(|(idx, _)| idx)
}

/// A line of a tool log that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidLine {
    /// One-based line number.
    pub line: usize,
    pub reason: String,
}

/// Non-fatal problems found while reading a tool log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolLogReport {
    pub invalid_lines: Vec<InvalidLine>,
}

/// A parsed tool log, sorted by timestamp.
#[derive(Debug, Clone, Default)]
pub struct ToolLog {
    records: Vec<ToolLogRecord>,
    report: ToolLogReport,
}

impl ToolLog {
    /// Parses JSONL text. Blank lines are ignored and invalid lines skipped.
    pub fn from_jsonl(text: &str) -> Self {
        let mut records = Vec::new();
        let mut report = ToolLogReport::default();

        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ToolLogRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(line = idx + 1, error = %err, "skipping invalid tool log line");
                    report.invalid_lines.push(InvalidLine {
                        line: idx + 1,
                        reason: err.to_string(),
                    });
                }
            }
        }

        records.sort_by_key(|record| record.timestamp);
        debug!(records = records.len(), "parsed tool log");
        ToolLog { records, report }
    }

    pub fn from_records(mut records: Vec<ToolLogRecord>) -> Self {
        records.sort_by_key(|record| record.timestamp);
        ToolLog {
            records,
            report: ToolLogReport::default(),
        }
    }

    /// Keeps records for the given conversation and records without one.
    pub fn for_conversation(&self, conversation_id: &str) -> ToolLog {
        let records = self
            .records
            .iter()
            .filter(|r| r.conversation_id.as_deref().is_none_or(|id| id == conversation_id))
            .cloned()
            .collect();
        ToolLog {
            records,
            report: self.report.clone(),
        }
    }

    pub fn records(&self) -> &[ToolLogRecord] {
        &self.records
    }

    pub fn report(&self) -> &ToolLogReport {
        &self.report
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
