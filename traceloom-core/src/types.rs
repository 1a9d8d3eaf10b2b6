// Copyright 2025 Traceloom Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Trace and span records with their create and patch payloads.
//!
//! Read models keep every client-facing field optional so the field
//! selector can zero excluded columns without a second representation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::comment::Comment;
use crate::feedback::FeedbackScore;
use crate::patch::{self, Patch};
use crate::time;

/// Which kind of entity a score, comment, or attachment hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Trace,
    Span,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Trace => "trace",
            EntityType::Span => "span",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    #[default]
    General,
    Llm,
    Tool,
}

impl SpanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanType::General => "general",
            SpanType::Llm => "llm",
            SpanType::Tool => "tool",
        }
    }
}

impl std::fmt::Display for SpanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SpanType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(SpanType::General),
            "llm" => Ok(SpanType::Llm),
            "tool" => Ok(SpanType::Tool),
            other => Err(format!("unknown span type '{other}'")),
        }
    }
}

/// Structured failure attached to a trace or span, stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub exception_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub traceback: String,
}

/// A span as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: Uuid,
    pub project_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub trace_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub span_type: Option<SpanType>,
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<HashMap<String, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_estimated_cost: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_estimated_cost_version: Option<String>,
    /// end_time - start_time in milliseconds, sub-millisecond decimal kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_scores: Option<Vec<FeedbackScore>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<Vec<Comment>>,
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(with = "time::rfc3339")]
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_by: Option<String>,
}

/// A trace as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: Uuid,
    pub project_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<HashMap<String, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_estimated_cost: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_estimated_cost_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_scores: Option<Vec<FeedbackScore>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<Vec<Comment>>,
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(with = "time::rfc3339")]
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_by: Option<String>,
}

/// Create payload for a span. Missing id means the server assigns one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanWrite {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub trace_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<Uuid>,
    pub name: String,
    #[serde(rename = "type", default)]
    pub span_type: SpanType,
    #[serde(with = "time::rfc3339")]
    pub start_time: DateTime<Utc>,
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<HashMap<String, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_estimated_cost: Option<Decimal>,
    /// Client-supplied write version; the server clock is used when absent.
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Partial update for a span. Absent keys leave stored values untouched;
/// explicit nulls clear collections.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpanUpdate {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub trace_id: Option<Uuid>,
    #[serde(default)]
    pub parent_span_id: Option<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub span_type: Option<SpanType>,
    #[serde(default, deserialize_with = "patch::datetime_strict")]
    pub end_time: Patch<DateTime<Utc>>,
    #[serde(default)]
    pub input: Patch<Value>,
    #[serde(default)]
    pub output: Patch<Value>,
    #[serde(default)]
    pub metadata: Patch<Value>,
    #[serde(default)]
    pub tags: Patch<Vec<String>>,
    #[serde(default)]
    pub usage: Patch<HashMap<String, i64>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub error_info: Patch<ErrorInfo>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub total_estimated_cost: Option<Decimal>,
    #[serde(default, with = "time::rfc3339_opt")]
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Create payload for a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceWrite {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub name: String,
    #[serde(with = "time::rfc3339")]
    pub start_time: DateTime<Utc>,
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<HashMap<String, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_estimated_cost: Option<Decimal>,
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Partial update for a trace.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceUpdate {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "patch::datetime_strict")]
    pub end_time: Patch<DateTime<Utc>>,
    #[serde(default)]
    pub input: Patch<Value>,
    #[serde(default)]
    pub output: Patch<Value>,
    #[serde(default)]
    pub metadata: Patch<Value>,
    #[serde(default)]
    pub tags: Patch<Vec<String>>,
    #[serde(default)]
    pub usage: Patch<HashMap<String, i64>>,
    #[serde(default)]
    pub error_info: Patch<ErrorInfo>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub total_estimated_cost: Option<Decimal>,
    #[serde(default, with = "time::rfc3339_opt")]
    pub last_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpanBatch {
    pub spans: Vec<SpanWrite>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraceBatch {
    pub traces: Vec<TraceWrite>,
}

/// Paged list envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub page: usize,
    pub size: usize,
    pub total: u64,
    pub content: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_type_wire_names() {
        assert_eq!(serde_json::to_string(&SpanType::Llm).unwrap(), "\"llm\"");
        let parsed: SpanType = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(parsed, SpanType::Tool);
    }

    #[test]
    fn span_write_rejects_timestamp_without_zone() {
        let err = serde_json::from_str::<SpanWrite>(
            r#"{"trace_id":"01903a80-0000-7000-8000-000000000000",
                "name":"root","start_time":"2024-01-01T00:00:00"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must end with 'Z'"));
    }

    #[test]
    fn span_update_distinguishes_null_from_absent() {
        let update: SpanUpdate =
            serde_json::from_str(r#"{"tags": null, "input": {"q": 1}}"#).unwrap();
        assert_eq!(update.tags, Patch::Null);
        assert!(update.input.as_set().is_some());
        assert!(update.metadata.is_absent());
    }

    #[test]
    fn read_model_omits_unset_fields() {
        let raw = format!(
            r#"{{"id":"{id}","project_id":"{id}","trace_id":"{id}",
                "last_updated_at":"2024-01-01T00:00:00Z"}}"#,
            id = crate::ids::new_v7()
        );
        let span: Span = serde_json::from_str(&raw).unwrap();
        let json = serde_json::to_value(&span).unwrap();
        assert!(json.get("input").is_none());
        assert!(json.get("total_estimated_cost").is_none());
        assert!(json.get("last_updated_at").is_some());
    }
}
