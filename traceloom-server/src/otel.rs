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

//! OTLP translation.
//!
//! OTel trace and span ids are opaque byte strings; the native model wants
//! time-ordered v7 UUIDs. Derivation combines a digest of the id bytes with
//! the earliest `start_time_unix_nano` seen for that trace, so every batch
//! of the same trace lands on the same UUID. The first derivation wins and
//! is pinned in a bounded per-workspace cache; spans reuse the timestamp
//! embedded in their trace's UUID so parent links resolve across batches.
//!
//! Attribute mapping follows a configurable rule table in the spirit of the
//! GenAI semantic conventions: provider, model and conversation attributes
//! become native columns, input/output-bearing attributes fold into the
//! JSON bodies, and everything else lands in `metadata` with type
//! detection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::any_value::Value as AnyValueKind;
use opentelemetry_proto::tonic::common::v1::AnyValue;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use traceloom_core::ids;
use traceloom_core::time;
use traceloom_core::types::{ErrorInfo, SpanType, SpanWrite, TraceWrite};

/// Attribute-to-field rules; process-wide, swapped atomically on reload.
#[derive(Debug, Clone)]
pub struct OtelRuleTable {
    pub provider_keys: Vec<String>,
    pub model_keys: Vec<String>,
    pub thread_keys: Vec<String>,
    pub input_keys: Vec<String>,
    pub output_keys: Vec<String>,
    pub tags_key: String,
    pub metadata_prefix: String,
    pub usage_prefix: String,
}

impl Default for OtelRuleTable {
    fn default() -> Self {
        Self {
            provider_keys: vec!["gen_ai.system".into()],
            model_keys: vec![
                "model_name".into(),
                "gen_ai.request.model".into(),
                "gen_ai.response.model".into(),
                "gen_ai.request_model".into(),
                "gen_ai.response_model".into(),
            ],
            thread_keys: vec!["thread_id".into(), "gen_ai.conversation.id".into()],
            input_keys: vec!["input".into(), "tools".into(), "all_messages".into()],
            output_keys: vec!["output".into(), "tool_responses".into()],
            tags_key: "traceloom.tags".into(),
            metadata_prefix: "traceloom.metadata.".into(),
            usage_prefix: "gen_ai.usage.".into(),
        }
    }
}

/// Batch translated into native writes, ready for the ingest pipeline.
#[derive(Debug, Default)]
pub struct TranslatedBatch {
    pub traces: Vec<(Uuid, TraceWrite)>,
    pub spans: Vec<(Uuid, SpanWrite)>,
}

pub struct OtelTranslator {
    rules: OtelRuleTable,
    id_cache: Cache<(String, Vec<u8>), Uuid>,
}

fn derive_id(id_bytes: &[u8], ts_ms: u64) -> Uuid {
    let digest = Sha256::digest(id_bytes);
    let mut entropy = [0u8; 10];
    entropy.copy_from_slice(&digest[..10]);
    ids::v7_from_parts(ts_ms, &entropy)
}

impl OtelTranslator {
    pub fn new(rules: OtelRuleTable) -> Self {
        Self {
            rules,
            id_cache: Cache::builder().max_capacity(100_000).build(),
        }
    }

    /// Derived trace UUID for a raw OTel id. First derivation wins: a later
    /// batch with an older earliest timestamp still maps to the pinned id.
    pub fn trace_uuid(&self, workspace_id: &str, otel_trace_id: &[u8], earliest_ms: u64) -> Uuid {
        let key = (workspace_id.to_string(), otel_trace_id.to_vec());
        self.id_cache
            .get_with(key, || derive_id(otel_trace_id, earliest_ms))
    }

    pub fn translate(
        &self,
        workspace_id: &str,
        request: &ExportTraceServiceRequest,
    ) -> TranslatedBatch {
        // Earliest start per raw trace id across the whole batch.
        let mut earliest_ns: HashMap<Vec<u8>, u64> = HashMap::new();
        for rs in &request.resource_spans {
            for ss in &rs.scope_spans {
                for span in &ss.spans {
                    let entry = earliest_ns
                        .entry(span.trace_id.clone())
                        .or_insert(span.start_time_unix_nano);
                    *entry = (*entry).min(span.start_time_unix_nano);
                }
            }
        }

        let mut batch = TranslatedBatch::default();
        // (trace uuid, raw id) -> aggregate for the synthesized trace row
        let mut trace_agg: HashMap<Uuid, TraceAggregate> = HashMap::new();
        // Duplicate span ids inside one export: last occurrence wins.
        let mut span_writes: HashMap<Uuid, SpanWrite> = HashMap::new();
        let mut span_order: Vec<Uuid> = Vec::new();

        for rs in &request.resource_spans {
            for ss in &rs.scope_spans {
                for span in &ss.spans {
                    let earliest = earliest_ns
                        .get(&span.trace_id)
                        .copied()
                        .unwrap_or(span.start_time_unix_nano);
                    let trace_uuid =
                        self.trace_uuid(workspace_id, &span.trace_id, earliest / 1_000_000);
                    // The pinned trace id fixes the timestamp all span ids use.
                    let ts_ms = ids::v7_timestamp_ms(&trace_uuid);

                    let span_uuid = derive_id(&span.span_id, ts_ms);
                    let parent_uuid = if span.parent_span_id.is_empty() {
                        None
                    } else {
                        Some(derive_id(&span.parent_span_id, ts_ms))
                    };

                    let write = self.map_span(span, trace_uuid, parent_uuid);
                    let agg = trace_agg.entry(trace_uuid).or_default();
                    agg.observe(span, &write);
                    if span_writes.insert(span_uuid, write).is_none() {
                        span_order.push(span_uuid);
                    }
                }
            }
        }

        for span_uuid in span_order {
            if let Some(write) = span_writes.remove(&span_uuid) {
                batch.spans.push((span_uuid, write));
            }
        }
        for (trace_uuid, agg) in trace_agg {
            batch.traces.push((trace_uuid, agg.into_write()));
        }
        batch
    }

    fn map_span(
        &self,
        span: &opentelemetry_proto::tonic::trace::v1::Span,
        trace_uuid: Uuid,
        parent_uuid: Option<Uuid>,
    ) -> SpanWrite {
        let mut attributes: HashMap<String, Value> = HashMap::new();
        for kv in &span.attributes {
            if let Some(value) = &kv.value {
                attributes.insert(kv.key.clone(), any_value_to_json(value));
            }
        }

        let mut provider = None;
        let mut model = None;
        let mut thread_id = None;
        let mut input = Map::new();
        let mut output = Map::new();
        let mut tags = None;
        let mut usage: HashMap<String, i64> = HashMap::new();
        let mut metadata = Map::new();

        for (key, value) in attributes {
            if self.rules.provider_keys.contains(&key) {
                provider = value.as_str().map(str::to_string);
            } else if self.rules.model_keys.contains(&key) {
                if model.is_none() || key.contains("request") {
                    model = value.as_str().map(str::to_string);
                }
            } else if self.rules.thread_keys.contains(&key) {
                // Integer conversation ids are stringified.
                thread_id = Some(match &value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            } else if self.rules.input_keys.contains(&key) {
                input.insert(key, detect_typed(value));
            } else if self.rules.output_keys.contains(&key) {
                output.insert(key, detect_typed(value));
            } else if key == self.rules.tags_key {
                tags = json_tags(&value);
            } else if let Some(flat) = key.strip_prefix(&self.rules.metadata_prefix) {
                metadata.insert(flat.to_string(), detect_typed(value));
            } else if let Some(counter) = key.strip_prefix(&self.rules.usage_prefix) {
                if let Some(count) = value.as_i64() {
                    usage.insert(counter.to_string(), count);
                }
            } else {
                metadata.insert(key, detect_typed(value));
            }
        }

        let span_type = if provider.is_some() || model.is_some() {
            SpanType::Llm
        } else {
            SpanType::General
        };

        let error_info = span.status.as_ref().and_then(|status| {
            (status.code
                == opentelemetry_proto::tonic::trace::v1::status::StatusCode::Error as i32)
                .then(|| ErrorInfo {
                    exception_type: "Error".to_string(),
                    message: (!status.message.is_empty()).then(|| status.message.clone()),
                    traceback: String::new(),
                })
        });

        SpanWrite {
            id: None,
            project_name: None,
            trace_id: trace_uuid,
            parent_span_id: parent_uuid,
            name: span.name.clone(),
            span_type,
            start_time: ns_to_datetime(span.start_time_unix_nano),
            end_time: (span.end_time_unix_nano > 0)
                .then(|| ns_to_datetime(span.end_time_unix_nano)),
            input: collapse(input, "input"),
            output: collapse(output, "output"),
            metadata: if metadata.is_empty() {
                None
            } else {
                Some(Value::Object(metadata))
            },
            model,
            provider,
            tags,
            usage: if usage.is_empty() { None } else { Some(usage) },
            error_info,
            thread_id,
            total_estimated_cost: None,
            last_updated_at: None,
        }
    }
}

/// Per-trace rollup used to synthesize the trace row for an export.
#[derive(Debug, Default)]
struct TraceAggregate {
    name: Option<String>,
    start_ns: Option<u64>,
    end_ns: Option<u64>,
    root_input: Option<Value>,
    root_output: Option<Value>,
    thread_id: Option<String>,
}

impl TraceAggregate {
    fn observe(&mut self, span: &opentelemetry_proto::tonic::trace::v1::Span, write: &SpanWrite) {
        let is_root = span.parent_span_id.is_empty();
        let earlier = self
            .start_ns
            .map(|s| span.start_time_unix_nano < s)
            .unwrap_or(true);
        if is_root || (self.name.is_none() && earlier) {
            self.name = Some(span.name.clone());
            self.root_input = write.input.clone();
            self.root_output = write.output.clone();
        }
        self.start_ns = Some(
            self.start_ns
                .map_or(span.start_time_unix_nano, |s| s.min(span.start_time_unix_nano)),
        );
        if span.end_time_unix_nano > 0 {
            self.end_ns = Some(
                self.end_ns
                    .map_or(span.end_time_unix_nano, |e| e.max(span.end_time_unix_nano)),
            );
        }
        if self.thread_id.is_none() {
            self.thread_id = write.thread_id.clone();
        }
    }

    fn into_write(self) -> TraceWrite {
        TraceWrite {
            id: None,
            project_name: None,
            name: self.name.unwrap_or_else(|| "trace".to_string()),
            start_time: ns_to_datetime(self.start_ns.unwrap_or_default()),
            end_time: self.end_ns.map(ns_to_datetime),
            input: self.root_input,
            output: self.root_output,
            metadata: None,
            tags: None,
            usage: None,
            error_info: None,
            thread_id: self.thread_id,
            total_estimated_cost: None,
            last_updated_at: None,
        }
    }
}

fn ns_to_datetime(nanos: u64) -> DateTime<Utc> {
    time::from_nanos(nanos.min(i64::MAX as u64) as i64)
}

/// A single `input`/`output` attribute keeps its tree shape; several
/// input-bearing attributes become sub-fields of one object.
fn collapse(map: Map<String, Value>, primary: &str) -> Option<Value> {
    if map.is_empty() {
        return None;
    }
    if map.len() == 1 {
        if let Some(value) = map.get(primary) {
            return Some(value.clone());
        }
    }
    Some(Value::Object(map))
}

fn json_tags(value: &Value) -> Option<Vec<String>> {
    let items = match value {
        Value::Array(items) => items.clone(),
        Value::String(raw) => serde_json::from_str::<Vec<Value>>(raw).ok()?,
        _ => return None,
    };
    Some(
        items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
    )
}

fn any_value_to_json(value: &AnyValue) -> Value {
    match &value.value {
        Some(AnyValueKind::StringValue(s)) => Value::String(s.clone()),
        Some(AnyValueKind::BoolValue(b)) => Value::Bool(*b),
        Some(AnyValueKind::IntValue(i)) => Value::from(*i),
        Some(AnyValueKind::DoubleValue(d)) => {
            serde_json::Number::from_f64(*d).map(Value::Number).unwrap_or(Value::Null)
        }
        Some(AnyValueKind::ArrayValue(items)) => {
            Value::Array(items.values.iter().map(any_value_to_json).collect())
        }
        Some(AnyValueKind::KvlistValue(kvs)) => {
            let mut map = Map::new();
            for kv in &kvs.values {
                if let Some(v) = &kv.value {
                    map.insert(kv.key.clone(), any_value_to_json(v));
                }
            }
            Value::Object(map)
        }
        Some(AnyValueKind::BytesValue(bytes)) => Value::String(hex::encode(bytes)),
        None => Value::Null,
    }
}

/// Catch-all type detection: JSON-looking strings are parsed, numeric
/// strings become numbers, everything else stays a string.
fn detect_typed(value: Value) -> Value {
    let Value::String(raw) = &value else {
        return value;
    };
    let trimmed = raw.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
            return parsed;
        }
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if float.is_finite() && trimmed.chars().any(|c| c.is_ascii_digit()) {
            if let Some(number) = serde_json::Number::from_f64(float) {
                return Value::Number(number);
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::KeyValue;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};

    fn string_attr(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(AnyValueKind::StringValue(value.to_string())),
            }),
        }
    }

    fn int_attr(key: &str, value: i64) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(AnyValueKind::IntValue(value)),
            }),
        }
    }

    fn request_with(spans: Vec<Span>) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                scope_spans: vec![ScopeSpans {
                    spans,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    fn otel_span(trace_id: &[u8], span_id: &[u8], start_ns: u64) -> Span {
        Span {
            trace_id: trace_id.to_vec(),
            span_id: span_id.to_vec(),
            name: "llm.call".to_string(),
            start_time_unix_nano: start_ns,
            end_time_unix_nano: start_ns + 1_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn trace_id_derivation_is_deterministic_and_first_wins() {
        let translator = OtelTranslator::new(OtelRuleTable::default());
        let raw = [0xAB; 16];

        let first = translator.trace_uuid("ws", &raw, 1_700_000_000_000);
        let second = translator.trace_uuid("ws", &raw, 2_000_000_000_000);
        assert_eq!(first, second);
        assert_eq!(ids::v7_timestamp_ms(&first), 1_700_000_000_000);
        assert_eq!(first.get_version_num(), 7);
    }

    #[test]
    fn batches_with_later_timestamps_map_to_the_same_ids() {
        let translator = OtelTranslator::new(OtelRuleTable::default());
        let raw_trace = [0x11; 16];

        let early = translator.translate(
            "ws",
            &request_with(vec![otel_span(&raw_trace, &[1; 8], 1_700_000_000_000_000_000)]),
        );
        let late = translator.translate(
            "ws",
            &request_with(vec![otel_span(&raw_trace, &[2; 8], 2_000_000_000_000_000_000)]),
        );

        assert_eq!(early.spans[0].1.trace_id, late.spans[0].1.trace_id);
        assert_eq!(
            ids::v7_timestamp_ms(&early.spans[0].1.trace_id),
            1_700_000_000_000
        );
    }

    #[test]
    fn parent_links_resolve_across_batches() {
        let translator = OtelTranslator::new(OtelRuleTable::default());
        let raw_trace = [0x22; 16];
        let parent_raw = [7; 8];

        let parent_batch = translator.translate(
            "ws",
            &request_with(vec![otel_span(&raw_trace, &parent_raw, 1_000_000_000_000_000_000)]),
        );
        let mut child = otel_span(&raw_trace, &[8; 8], 1_500_000_000_000_000_000);
        child.parent_span_id = parent_raw.to_vec();
        let child_batch = translator.translate("ws", &request_with(vec![child]));

        let parent_uuid = parent_batch.spans[0].0;
        assert_eq!(child_batch.spans[0].1.parent_span_id, Some(parent_uuid));
    }

    #[test]
    fn genai_attributes_map_to_native_fields() {
        let translator = OtelTranslator::new(OtelRuleTable::default());
        let mut span = otel_span(&[0x33; 16], &[1; 8], 1_700_000_000_000_000_000);
        span.attributes = vec![
            string_attr("gen_ai.system", "anthropic"),
            string_attr("gen_ai.request.model", "claude-3-haiku"),
            int_attr("gen_ai.conversation.id", 42),
            int_attr("gen_ai.usage.input_tokens", 1000),
            int_attr("gen_ai.usage.output_tokens", 250),
            string_attr("traceloom.tags", r#"["prod","beta"]"#),
            string_attr("traceloom.metadata.region", "eu-west-1"),
            string_attr("custom.count", "17"),
            string_attr("custom.payload", r#"{"a": 1}"#),
        ];

        let batch = translator.translate("ws", &request_with(vec![span]));
        let (_, write) = &batch.spans[0];

        assert_eq!(write.provider.as_deref(), Some("anthropic"));
        assert_eq!(write.model.as_deref(), Some("claude-3-haiku"));
        assert_eq!(write.span_type, SpanType::Llm);
        assert_eq!(write.thread_id.as_deref(), Some("42"));
        assert_eq!(
            write.tags,
            Some(vec!["prod".to_string(), "beta".to_string()])
        );
        let usage = write.usage.as_ref().unwrap();
        assert_eq!(usage["input_tokens"], 1000);
        assert_eq!(usage["output_tokens"], 250);
        let metadata = write.metadata.as_ref().unwrap();
        assert_eq!(metadata["region"], "eu-west-1");
        assert_eq!(metadata["custom.count"], 17);
        assert_eq!(metadata["custom.payload"]["a"], 1);
    }

    #[test]
    fn duplicate_span_ids_in_one_export_keep_the_last_occurrence() {
        let translator = OtelTranslator::new(OtelRuleTable::default());
        let raw_trace = [0x44; 16];
        let mut first = otel_span(&raw_trace, &[9; 8], 1_700_000_000_000_000_000);
        first.name = "first".to_string();
        let mut second = otel_span(&raw_trace, &[9; 8], 1_700_000_000_000_000_000);
        second.name = "second".to_string();

        let batch = translator.translate("ws", &request_with(vec![first, second]));
        assert_eq!(batch.spans.len(), 1);
        assert_eq!(batch.spans[0].1.name, "second");
    }

    #[test]
    fn a_trace_row_is_synthesized_from_the_root_span() {
        let translator = OtelTranslator::new(OtelRuleTable::default());
        let raw_trace = [0x55; 16];
        let mut root = otel_span(&raw_trace, &[1; 8], 1_700_000_000_000_000_000);
        root.name = "invocation".to_string();
        let mut child = otel_span(&raw_trace, &[2; 8], 1_700_000_000_500_000_000);
        child.parent_span_id = vec![1; 8];
        child.end_time_unix_nano = 1_700_000_002_000_000_000;

        let batch = translator.translate("ws", &request_with(vec![root, child]));
        assert_eq!(batch.traces.len(), 1);
        let (trace_uuid, trace) = &batch.traces[0];
        assert_eq!(trace.name, "invocation");
        assert_eq!(*trace_uuid, batch.spans[0].1.trace_id);
        assert_eq!(
            trace.end_time.map(|dt| time::to_nanos(&dt)),
            Some(1_700_000_002_000_000_000)
        );
    }

    #[test]
    fn workspaces_do_not_share_the_id_cache() {
        let translator = OtelTranslator::new(OtelRuleTable::default());
        let raw = [0x66; 16];
        let a = translator.trace_uuid("ws-a", &raw, 1_700_000_000_000);
        let b = translator.trace_uuid("ws-b", &raw, 1_800_000_000_000);
        assert_ne!(ids::v7_timestamp_ms(&a), ids::v7_timestamp_ms(&b));
    }
}
