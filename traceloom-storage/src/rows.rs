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

//! Row models, one struct per table.
//!
//! Columns use storage-native encodings: timestamps are Int64 nanoseconds,
//! JSON trees are serialized strings with "" for absent, the usage map is a
//! pair of parallel arrays, a nil UUID marks a missing parent, and a zero
//! cost means "absent". The conversions at the bottom translate between
//! these rows and the wire-facing domain records.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clickhouse::Row;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use traceloom_core::cost::floor_to_cost_scale;
use traceloom_core::time;
use traceloom_core::types::{ErrorInfo, Span, SpanType, Trace};

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct SpanRow {
    pub workspace_id: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub project_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    pub id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    pub trace_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    pub parent_span_id: Uuid,
    pub name: String,
    pub span_type: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub input: String,
    pub output: String,
    pub metadata: String,
    pub model: String,
    pub provider: String,
    pub tags: Vec<String>,
    pub usage_keys: Vec<String>,
    pub usage_values: Vec<i64>,
    pub error_info: String,
    pub thread_id: String,
    pub total_estimated_cost: f64,
    pub total_estimated_cost_version: String,
    pub created_at: i64,
    pub created_by: String,
    pub last_updated_at: i64,
    pub last_updated_by: String,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct TraceRow {
    pub workspace_id: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub project_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    pub id: Uuid,
    pub name: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub input: String,
    pub output: String,
    pub metadata: String,
    pub tags: Vec<String>,
    pub usage_keys: Vec<String>,
    pub usage_values: Vec<i64>,
    pub error_info: String,
    pub thread_id: String,
    pub total_estimated_cost: f64,
    pub total_estimated_cost_version: String,
    pub created_at: i64,
    pub created_by: String,
    pub last_updated_at: i64,
    pub last_updated_by: String,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct FeedbackScoreRow {
    pub workspace_id: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub project_id: Uuid,
    pub entity_type: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub entity_id: Uuid,
    pub name: String,
    pub category_name: String,
    /// Score value scaled by 1e9 for exact nine-decimal storage.
    pub value_nanos: i64,
    pub reason: String,
    pub source: String,
    pub created_at: i64,
    pub created_by: String,
    pub last_updated_at: i64,
    pub last_updated_by: String,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct CommentRow {
    pub workspace_id: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub project_id: Uuid,
    pub entity_type: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub entity_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    pub id: Uuid,
    pub text: String,
    pub created_at: i64,
    pub created_by: String,
    pub last_updated_at: i64,
    pub last_updated_by: String,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct AttachmentRow {
    pub workspace_id: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub project_id: Uuid,
    pub entity_type: String,
    #[serde(with = "clickhouse::serde::uuid")]
    pub entity_id: Uuid,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub source: String,
    pub created_at: i64,
}

/// "" to None and back for string columns.
pub fn opt_str(raw: &str) -> Option<String> {
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

pub fn str_or_empty(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

/// JSON column to tree and back. A malformed stored string surfaces as a JSON string
/// value rather than an error, matching store-what-you-were-given.
pub fn opt_json(raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    Some(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}

pub fn json_or_empty(value: Option<&Value>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn usage_to_arrays(usage: Option<&HashMap<String, i64>>) -> (Vec<String>, Vec<i64>) {
    match usage {
        Some(map) if !map.is_empty() => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            (
                pairs.iter().map(|(k, _)| (*k).clone()).collect(),
                pairs.iter().map(|(_, v)| **v).collect(),
            )
        }
        _ => (Vec::new(), Vec::new()),
    }
}

pub fn arrays_to_usage(keys: &[String], values: &[i64]) -> Option<HashMap<String, i64>> {
    if keys.is_empty() {
        return None;
    }
    Some(
        keys.iter()
            .cloned()
            .zip(values.iter().copied())
            .collect::<HashMap<_, _>>(),
    )
}

/// Zero means absent for the cost column.
pub fn opt_cost(raw: f64) -> Option<Decimal> {
    if raw == 0.0 {
        return None;
    }
    Decimal::from_f64(raw).map(floor_to_cost_scale)
}

pub fn cost_or_zero(cost: Option<Decimal>) -> f64 {
    cost.and_then(|c| c.to_f64()).unwrap_or(0.0)
}

pub fn opt_error_info(raw: &str) -> Option<ErrorInfo> {
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

pub fn error_info_or_empty(info: Option<&ErrorInfo>) -> String {
    info.and_then(|i| serde_json::to_string(i).ok())
        .unwrap_or_default()
}

pub fn opt_uuid(id: Uuid) -> Option<Uuid> {
    if id.is_nil() {
        None
    } else {
        Some(id)
    }
}

fn opt_tags(tags: &[String]) -> Option<Vec<String>> {
    if tags.is_empty() {
        None
    } else {
        Some(tags.to_vec())
    }
}

impl SpanRow {
    pub fn into_span(self) -> Span {
        let start_time = time::from_nanos(self.start_time);
        let end_time = self.end_time.map(time::from_nanos);
        let duration = time::duration_millis(&start_time, end_time.as_ref());
        Span {
            id: self.id,
            project_id: self.project_id,
            project_name: None,
            trace_id: self.trace_id,
            parent_span_id: opt_uuid(self.parent_span_id),
            name: opt_str(&self.name),
            span_type: SpanType::from_str(&self.span_type).ok(),
            start_time: Some(start_time),
            end_time,
            input: opt_json(&self.input),
            output: opt_json(&self.output),
            metadata: opt_json(&self.metadata),
            model: opt_str(&self.model),
            provider: opt_str(&self.provider),
            tags: opt_tags(&self.tags),
            usage: arrays_to_usage(&self.usage_keys, &self.usage_values),
            error_info: opt_error_info(&self.error_info),
            thread_id: opt_str(&self.thread_id),
            total_estimated_cost: opt_cost(self.total_estimated_cost),
            total_estimated_cost_version: opt_str(&self.total_estimated_cost_version),
            duration,
            feedback_scores: None,
            comments: None,
            created_at: Some(time::from_nanos(self.created_at)),
            last_updated_at: time::from_nanos(self.last_updated_at),
            created_by: opt_str(&self.created_by),
            last_updated_by: opt_str(&self.last_updated_by),
        }
    }
}

impl TraceRow {
    pub fn into_trace(self) -> Trace {
        let start_time = time::from_nanos(self.start_time);
        let end_time = self.end_time.map(time::from_nanos);
        let duration = time::duration_millis(&start_time, end_time.as_ref());
        Trace {
            id: self.id,
            project_id: self.project_id,
            project_name: None,
            name: opt_str(&self.name),
            start_time: Some(start_time),
            end_time,
            input: opt_json(&self.input),
            output: opt_json(&self.output),
            metadata: opt_json(&self.metadata),
            tags: opt_tags(&self.tags),
            usage: arrays_to_usage(&self.usage_keys, &self.usage_values),
            error_info: opt_error_info(&self.error_info),
            thread_id: opt_str(&self.thread_id),
            total_estimated_cost: opt_cost(self.total_estimated_cost),
            total_estimated_cost_version: opt_str(&self.total_estimated_cost_version),
            duration,
            feedback_scores: None,
            comments: None,
            created_at: Some(time::from_nanos(self.created_at)),
            last_updated_at: time::from_nanos(self.last_updated_at),
            created_by: opt_str(&self.created_by),
            last_updated_by: opt_str(&self.last_updated_by),
        }
    }
}

/// Score value to the scaled Int64 column and back.
pub fn score_to_nanos(value: Decimal) -> i64 {
    let mut scaled = value;
    scaled.rescale(9);
    scaled.mantissa() as i64
}

pub fn score_from_nanos(nanos: i64) -> Decimal {
    Decimal::from_i128_with_scale(nanos as i128, 9).normalize()
}

pub fn nanos(dt: &DateTime<Utc>) -> i64 {
    time::to_nanos(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn score_nanos_roundtrip_keeps_nine_places() {
        let value = dec!(123.456789012);
        assert_eq!(score_from_nanos(score_to_nanos(value)), value);
        assert_eq!(score_to_nanos(dec!(1)), 1_000_000_000);
        assert_eq!(score_from_nanos(-1_500_000_000), dec!(-1.5));
    }

    #[test]
    fn usage_arrays_roundtrip() {
        let mut usage = HashMap::new();
        usage.insert("completion_tokens".to_string(), 10);
        usage.insert("prompt_tokens".to_string(), 20);
        let (keys, values) = usage_to_arrays(Some(&usage));
        assert_eq!(keys, vec!["completion_tokens", "prompt_tokens"]);
        assert_eq!(values, vec![10, 20]);
        assert_eq!(arrays_to_usage(&keys, &values), Some(usage));
        assert_eq!(arrays_to_usage(&[], &[]), None);
    }

    #[test]
    fn zero_cost_reads_as_absent() {
        assert_eq!(opt_cost(0.0), None);
        assert_eq!(opt_cost(0.0075), Some(dec!(0.0075)));
    }

    #[test]
    fn nil_parent_reads_as_absent() {
        assert_eq!(opt_uuid(Uuid::nil()), None);
        let id = Uuid::now_v7();
        assert_eq!(opt_uuid(id), Some(id));
    }
}
