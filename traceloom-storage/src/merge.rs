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

//! The write merge.
//!
//! An entity moves through three states: absent, SHADOW (a partial update
//! arrived before its create; `start_time` is the epoch), and MATERIALIZED.
//! Every write reads the stored latest version, merges field by field under
//! last-writer-wins, and emits one new version row. The rules:
//!
//! * `trace_id`, `parent_span_id`, and the project are immutable once set;
//!   divergence is a conflict and nothing is written.
//! * A write whose `last_updated_at` is not newer than the stored version is
//!   dropped silently.
//! * Empty means absent: `[]`, `{}`, blank strings, and a zero cost do not
//!   overwrite stored values. An explicit `null` on a collection clears it.
//! * Cost is recomputed when `model`, `provider`, `usage`, or `metadata`
//!   changed, unless a manual override is in force.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use traceloom_core::cost::{CostError, PricingTable};
use traceloom_core::types::{SpanUpdate, SpanWrite, TraceUpdate, TraceWrite};
use traceloom_core::Patch;

use crate::error::StoreError;
use crate::rows::{
    arrays_to_usage, cost_or_zero, error_info_or_empty, json_or_empty, nanos, opt_json,
    str_or_empty, usage_to_arrays, SpanRow, TraceRow,
};

pub const CONFLICT_PROJECT_SPAN: &str =
    "Project name and workspace name do not match the existing span";
pub const CONFLICT_PROJECT_TRACE: &str =
    "Project name and workspace name do not match the existing trace";
pub const CONFLICT_TRACE_ID: &str = "trace_id does not match the existing span";
pub const CONFLICT_PARENT_SPAN_ID: &str = "parent_span_id does not match the existing span";

/// Who and where a write comes from.
#[derive(Debug, Clone)]
pub struct WriteContext {
    pub workspace_id: String,
    pub project_id: Uuid,
    pub username: String,
    pub now: DateTime<Utc>,
}

/// Result of merging one write against the stored latest version.
#[derive(Debug)]
pub enum WriteOutcome<R> {
    /// Insert this new version row.
    Write(R),
    /// Older than the stored version; dropped without error.
    Stale,
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// `null`, `{}`, `[]`, and `""` all count as "nothing to store".
fn json_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Keep `incoming` when it carries something, else the stored string.
fn merge_string(stored: &str, incoming: Option<&str>) -> String {
    match incoming {
        Some(v) if !is_blank(v) => v.to_string(),
        _ => stored.to_string(),
    }
}

fn merge_json_write(stored: &str, incoming: Option<&Value>) -> String {
    match incoming {
        Some(v) if !json_is_empty(v) => v.to_string(),
        _ => stored.to_string(),
    }
}

fn merge_json_patch(stored: &str, incoming: &Patch<Value>) -> String {
    match incoming {
        Patch::Set(v) if !json_is_empty(v) => v.to_string(),
        Patch::Set(_) => stored.to_string(),
        Patch::Null => String::new(),
        Patch::Absent => stored.to_string(),
    }
}

fn merge_tags_write(stored: &[String], incoming: Option<&Vec<String>>) -> Vec<String> {
    match incoming {
        Some(tags) if !tags.is_empty() => tags.clone(),
        _ => stored.to_vec(),
    }
}

fn merge_tags_patch(stored: &[String], incoming: &Patch<Vec<String>>) -> Vec<String> {
    match incoming {
        Patch::Set(tags) if !tags.is_empty() => tags.clone(),
        Patch::Set(_) => stored.to_vec(),
        Patch::Null => Vec::new(),
        Patch::Absent => stored.to_vec(),
    }
}

fn merge_usage_write(
    stored: (&[String], &[i64]),
    incoming: Option<&HashMap<String, i64>>,
) -> (Vec<String>, Vec<i64>) {
    match incoming {
        Some(map) if !map.is_empty() => usage_to_arrays(Some(map)),
        _ => (stored.0.to_vec(), stored.1.to_vec()),
    }
}

fn merge_usage_patch(
    stored: (&[String], &[i64]),
    incoming: &Patch<HashMap<String, i64>>,
) -> (Vec<String>, Vec<i64>) {
    match incoming {
        Patch::Set(map) if !map.is_empty() => usage_to_arrays(Some(map)),
        Patch::Set(_) => (stored.0.to_vec(), stored.1.to_vec()),
        Patch::Null => (Vec::new(), Vec::new()),
        Patch::Absent => (stored.0.to_vec(), stored.1.to_vec()),
    }
}

/// Inputs the cost derivation reads, in their merged storage encoding.
struct CostInputs<'a> {
    model: &'a str,
    provider: &'a str,
    usage_keys: &'a [String],
    usage_values: &'a [i64],
    metadata: &'a str,
}

impl CostInputs<'_> {
    fn changed_from(&self, row: &SpanRow) -> bool {
        self.model != row.model
            || self.provider != row.provider
            || self.usage_keys != row.usage_keys
            || self.usage_values != row.usage_values
            || self.metadata != row.metadata
    }

    fn changed_from_trace(&self, row: &TraceRow) -> bool {
        self.usage_keys != row.usage_keys
            || self.usage_values != row.usage_values
            || self.metadata != row.metadata
    }
}

fn map_cost_error(err: CostError) -> StoreError {
    StoreError::Validation(err.to_string())
}

/// Cost column resolution for one write. An empty version string marks a
/// manual override (or metadata passthrough), which later recomputations
/// must not clobber.
fn resolve_cost(
    stored: Option<(f64, &str)>,
    manual: Option<Decimal>,
    inputs: &CostInputs<'_>,
    inputs_changed: bool,
    pricing: &PricingTable,
) -> Result<(f64, String), StoreError> {
    if let Some(manual) = manual {
        if manual.is_sign_negative() && !manual.is_zero() {
            return Err(map_cost_error(CostError::NegativeManual));
        }
        if !manual.is_zero() {
            return Ok((
                cost_or_zero(Some(traceloom_core::cost::floor_to_cost_scale(manual))),
                String::new(),
            ));
        }
    }

    if let Some((amount, version)) = stored {
        // A stored manual override survives any recomputation.
        if amount > 0.0 && version.is_empty() {
            return Ok((amount, version.to_string()));
        }
        if !inputs_changed {
            return Ok((amount, version.to_string()));
        }
    }

    let usage = arrays_to_usage(inputs.usage_keys, inputs.usage_values).unwrap_or_default();
    let metadata = opt_json(inputs.metadata);
    let estimate = pricing
        .estimate(
            if inputs.model.is_empty() {
                None
            } else {
                Some(inputs.model)
            },
            if inputs.provider.is_empty() {
                None
            } else {
                Some(inputs.provider)
            },
            &usage,
            metadata.as_ref(),
            None,
        )
        .map_err(map_cost_error)?;

    Ok(match estimate {
        Some(est) => (
            cost_or_zero(Some(est.amount)),
            est.version.unwrap_or_default(),
        ),
        None => (0.0, String::new()),
    })
}

/// Effective write version: client-supplied wins, else the server clock.
fn effective_version(client: Option<&DateTime<Utc>>, now: &DateTime<Utc>) -> i64 {
    client.map(nanos).unwrap_or_else(|| nanos(now))
}

// ---------------------------------------------------------------------------
// Spans
// ---------------------------------------------------------------------------

pub fn create_span(
    existing: Option<&SpanRow>,
    ctx: &WriteContext,
    id: Uuid,
    write: &SpanWrite,
    pricing: &PricingTable,
) -> Result<WriteOutcome<SpanRow>, StoreError> {
    let Some(stored) = existing else {
        return Ok(WriteOutcome::Write(fresh_span_row(ctx, id, write, pricing)?));
    };

    if stored.project_id != ctx.project_id {
        return Err(StoreError::conflict(CONFLICT_PROJECT_SPAN));
    }
    if !stored.trace_id.is_nil() && stored.trace_id != write.trace_id {
        return Err(StoreError::conflict(CONFLICT_TRACE_ID));
    }
    if let Some(parent) = write.parent_span_id {
        if !stored.parent_span_id.is_nil() && stored.parent_span_id != parent {
            return Err(StoreError::conflict(CONFLICT_PARENT_SPAN_ID));
        }
    }

    let version = effective_version(write.last_updated_at.as_ref(), &ctx.now);
    if version <= stored.last_updated_at {
        return Ok(WriteOutcome::Stale);
    }

    let input = merge_json_write(&stored.input, write.input.as_ref());
    let output = merge_json_write(&stored.output, write.output.as_ref());
    let metadata = merge_json_write(&stored.metadata, write.metadata.as_ref());
    let model = merge_string(&stored.model, write.model.as_deref());
    let provider = merge_string(&stored.provider, write.provider.as_deref());
    let (usage_keys, usage_values) = merge_usage_write(
        (&stored.usage_keys, &stored.usage_values),
        write.usage.as_ref(),
    );

    let cost_inputs = CostInputs {
        model: &model,
        provider: &provider,
        usage_keys: &usage_keys,
        usage_values: &usage_values,
        metadata: &metadata,
    };
    let inputs_changed = cost_inputs.changed_from(stored);
    let (cost, cost_version) = resolve_cost(
        Some((stored.total_estimated_cost, &stored.total_estimated_cost_version)),
        write.total_estimated_cost,
        &cost_inputs,
        inputs_changed,
        pricing,
    )?;

    Ok(WriteOutcome::Write(SpanRow {
        workspace_id: ctx.workspace_id.clone(),
        project_id: ctx.project_id,
        id,
        trace_id: write.trace_id,
        parent_span_id: if stored.parent_span_id.is_nil() {
            write.parent_span_id.unwrap_or(Uuid::nil())
        } else {
            stored.parent_span_id
        },
        name: merge_string(&stored.name, Some(&write.name)),
        span_type: write.span_type.as_str().to_string(),
        start_time: nanos(&write.start_time),
        end_time: write.end_time.as_ref().map(nanos).or(stored.end_time),
        input,
        output,
        metadata,
        model,
        provider,
        tags: merge_tags_write(&stored.tags, write.tags.as_ref()),
        usage_keys,
        usage_values,
        error_info: match &write.error_info {
            Some(info) => error_info_or_empty(Some(info)),
            None => stored.error_info.clone(),
        },
        thread_id: merge_string(&stored.thread_id, write.thread_id.as_deref()),
        total_estimated_cost: cost,
        total_estimated_cost_version: cost_version,
        created_at: stored.created_at,
        created_by: if stored.created_by.is_empty() {
            ctx.username.clone()
        } else {
            stored.created_by.clone()
        },
        last_updated_at: version,
        last_updated_by: ctx.username.clone(),
    }))
}

fn fresh_span_row(
    ctx: &WriteContext,
    id: Uuid,
    write: &SpanWrite,
    pricing: &PricingTable,
) -> Result<SpanRow, StoreError> {
    let input = json_or_empty(write.input.as_ref().filter(|v| !json_is_empty(v)));
    let output = json_or_empty(write.output.as_ref().filter(|v| !json_is_empty(v)));
    let metadata = json_or_empty(write.metadata.as_ref().filter(|v| !json_is_empty(v)));
    let model = str_or_empty(write.model.as_deref().filter(|s| !is_blank(s)));
    let provider = str_or_empty(write.provider.as_deref().filter(|s| !is_blank(s)));
    let (usage_keys, usage_values) = usage_to_arrays(write.usage.as_ref());

    let cost_inputs = CostInputs {
        model: &model,
        provider: &provider,
        usage_keys: &usage_keys,
        usage_values: &usage_values,
        metadata: &metadata,
    };
    let (cost, cost_version) = resolve_cost(
        None,
        write.total_estimated_cost,
        &cost_inputs,
        true,
        pricing,
    )?;

    Ok(SpanRow {
        workspace_id: ctx.workspace_id.clone(),
        project_id: ctx.project_id,
        id,
        trace_id: write.trace_id,
        parent_span_id: write.parent_span_id.unwrap_or(Uuid::nil()),
        name: write.name.clone(),
        span_type: write.span_type.as_str().to_string(),
        start_time: nanos(&write.start_time),
        end_time: write.end_time.as_ref().map(nanos),
        input,
        output,
        metadata,
        model,
        provider,
        tags: write.tags.clone().unwrap_or_default(),
        usage_keys,
        usage_values,
        error_info: error_info_or_empty(write.error_info.as_ref()),
        thread_id: str_or_empty(write.thread_id.as_deref().filter(|s| !is_blank(s))),
        total_estimated_cost: cost,
        total_estimated_cost_version: cost_version,
        created_at: nanos(&ctx.now),
        created_by: ctx.username.clone(),
        last_updated_at: effective_version(write.last_updated_at.as_ref(), &ctx.now),
        last_updated_by: ctx.username.clone(),
    })
}

pub fn update_span(
    existing: Option<&SpanRow>,
    ctx: &WriteContext,
    id: Uuid,
    update: &SpanUpdate,
    pricing: &PricingTable,
) -> Result<WriteOutcome<SpanRow>, StoreError> {
    let Some(stored) = existing else {
        return Ok(WriteOutcome::Write(shadow_span_row(ctx, id, update, pricing)?));
    };

    if stored.project_id != ctx.project_id {
        return Err(StoreError::conflict(CONFLICT_PROJECT_SPAN));
    }
    if let Some(trace_id) = update.trace_id {
        if !stored.trace_id.is_nil() && stored.trace_id != trace_id {
            return Err(StoreError::conflict(CONFLICT_TRACE_ID));
        }
    }
    if let Some(parent) = update.parent_span_id {
        if !stored.parent_span_id.is_nil() && stored.parent_span_id != parent {
            return Err(StoreError::conflict(CONFLICT_PARENT_SPAN_ID));
        }
    }

    let version = effective_version(update.last_updated_at.as_ref(), &ctx.now);
    if version <= stored.last_updated_at {
        return Ok(WriteOutcome::Stale);
    }

    let input = merge_json_patch(&stored.input, &update.input);
    let output = merge_json_patch(&stored.output, &update.output);
    let metadata = merge_json_patch(&stored.metadata, &update.metadata);
    let model = merge_string(&stored.model, update.model.as_deref());
    let provider = merge_string(&stored.provider, update.provider.as_deref());
    let (usage_keys, usage_values) =
        merge_usage_patch((&stored.usage_keys, &stored.usage_values), &update.usage);

    let cost_inputs = CostInputs {
        model: &model,
        provider: &provider,
        usage_keys: &usage_keys,
        usage_values: &usage_values,
        metadata: &metadata,
    };
    let inputs_changed = cost_inputs.changed_from(stored);
    let (cost, cost_version) = resolve_cost(
        Some((stored.total_estimated_cost, &stored.total_estimated_cost_version)),
        update.total_estimated_cost,
        &cost_inputs,
        inputs_changed,
        pricing,
    )?;

    Ok(WriteOutcome::Write(SpanRow {
        workspace_id: ctx.workspace_id.clone(),
        project_id: ctx.project_id,
        id,
        trace_id: if stored.trace_id.is_nil() {
            update.trace_id.unwrap_or(Uuid::nil())
        } else {
            stored.trace_id
        },
        parent_span_id: if stored.parent_span_id.is_nil() {
            update.parent_span_id.unwrap_or(Uuid::nil())
        } else {
            stored.parent_span_id
        },
        name: merge_string(&stored.name, update.name.as_deref()),
        span_type: match update.span_type {
            Some(t) => t.as_str().to_string(),
            None => stored.span_type.clone(),
        },
        start_time: stored.start_time,
        end_time: match &update.end_time {
            Patch::Set(end) => Some(nanos(end)),
            _ => stored.end_time,
        },
        input,
        output,
        metadata,
        model,
        provider,
        tags: merge_tags_patch(&stored.tags, &update.tags),
        usage_keys,
        usage_values,
        error_info: match &update.error_info {
            Patch::Set(info) => error_info_or_empty(Some(info)),
            Patch::Null => String::new(),
            Patch::Absent => stored.error_info.clone(),
        },
        thread_id: merge_string(&stored.thread_id, update.thread_id.as_deref()),
        total_estimated_cost: cost,
        total_estimated_cost_version: cost_version,
        created_at: stored.created_at,
        created_by: if stored.created_by.is_empty() {
            ctx.username.clone()
        } else {
            stored.created_by.clone()
        },
        last_updated_at: version,
        last_updated_by: ctx.username.clone(),
    }))
}

/// An update for an id nobody has created yet: record it as a shadow row at
/// the epoch, ready for a later create to merge into.
fn shadow_span_row(
    ctx: &WriteContext,
    id: Uuid,
    update: &SpanUpdate,
    pricing: &PricingTable,
) -> Result<SpanRow, StoreError> {
    let input = merge_json_patch("", &update.input);
    let output = merge_json_patch("", &update.output);
    let metadata = merge_json_patch("", &update.metadata);
    let model = str_or_empty(update.model.as_deref().filter(|s| !is_blank(s)));
    let provider = str_or_empty(update.provider.as_deref().filter(|s| !is_blank(s)));
    let (usage_keys, usage_values) = merge_usage_patch((&[], &[]), &update.usage);

    let cost_inputs = CostInputs {
        model: &model,
        provider: &provider,
        usage_keys: &usage_keys,
        usage_values: &usage_values,
        metadata: &metadata,
    };
    let (cost, cost_version) = resolve_cost(
        None,
        update.total_estimated_cost,
        &cost_inputs,
        true,
        pricing,
    )?;

    Ok(SpanRow {
        workspace_id: ctx.workspace_id.clone(),
        project_id: ctx.project_id,
        id,
        trace_id: update.trace_id.unwrap_or(Uuid::nil()),
        parent_span_id: update.parent_span_id.unwrap_or(Uuid::nil()),
        name: str_or_empty(update.name.as_deref().filter(|s| !is_blank(s))),
        span_type: update
            .span_type
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        start_time: 0,
        end_time: update.end_time.as_set().map(nanos),
        input,
        output,
        metadata,
        model,
        provider,
        tags: merge_tags_patch(&[], &update.tags),
        usage_keys,
        usage_values,
        error_info: match &update.error_info {
            Patch::Set(info) => error_info_or_empty(Some(info)),
            _ => String::new(),
        },
        thread_id: str_or_empty(update.thread_id.as_deref().filter(|s| !is_blank(s))),
        total_estimated_cost: cost,
        total_estimated_cost_version: cost_version,
        created_at: nanos(&ctx.now),
        created_by: ctx.username.clone(),
        last_updated_at: effective_version(update.last_updated_at.as_ref(), &ctx.now),
        last_updated_by: ctx.username.clone(),
    })
}

// ---------------------------------------------------------------------------
// Traces
// ---------------------------------------------------------------------------

pub fn create_trace(
    existing: Option<&TraceRow>,
    ctx: &WriteContext,
    id: Uuid,
    write: &TraceWrite,
    pricing: &PricingTable,
) -> Result<WriteOutcome<TraceRow>, StoreError> {
    let Some(stored) = existing else {
        return Ok(WriteOutcome::Write(fresh_trace_row(ctx, id, write, pricing)?));
    };

    if stored.project_id != ctx.project_id {
        return Err(StoreError::conflict(CONFLICT_PROJECT_TRACE));
    }

    let version = effective_version(write.last_updated_at.as_ref(), &ctx.now);
    if version <= stored.last_updated_at {
        return Ok(WriteOutcome::Stale);
    }

    let metadata = merge_json_write(&stored.metadata, write.metadata.as_ref());
    let (usage_keys, usage_values) = merge_usage_write(
        (&stored.usage_keys, &stored.usage_values),
        write.usage.as_ref(),
    );

    let cost_inputs = CostInputs {
        model: "",
        provider: "",
        usage_keys: &usage_keys,
        usage_values: &usage_values,
        metadata: &metadata,
    };
    let inputs_changed = cost_inputs.changed_from_trace(stored);
    let (cost, cost_version) = resolve_cost(
        Some((stored.total_estimated_cost, &stored.total_estimated_cost_version)),
        write.total_estimated_cost,
        &cost_inputs,
        inputs_changed,
        pricing,
    )?;

    Ok(WriteOutcome::Write(TraceRow {
        workspace_id: ctx.workspace_id.clone(),
        project_id: ctx.project_id,
        id,
        name: merge_string(&stored.name, Some(&write.name)),
        start_time: nanos(&write.start_time),
        end_time: write.end_time.as_ref().map(nanos).or(stored.end_time),
        input: merge_json_write(&stored.input, write.input.as_ref()),
        output: merge_json_write(&stored.output, write.output.as_ref()),
        metadata,
        tags: merge_tags_write(&stored.tags, write.tags.as_ref()),
        usage_keys,
        usage_values,
        error_info: match &write.error_info {
            Some(info) => error_info_or_empty(Some(info)),
            None => stored.error_info.clone(),
        },
        thread_id: merge_string(&stored.thread_id, write.thread_id.as_deref()),
        total_estimated_cost: cost,
        total_estimated_cost_version: cost_version,
        created_at: stored.created_at,
        created_by: if stored.created_by.is_empty() {
            ctx.username.clone()
        } else {
            stored.created_by.clone()
        },
        last_updated_at: version,
        last_updated_by: ctx.username.clone(),
    }))
}

fn fresh_trace_row(
    ctx: &WriteContext,
    id: Uuid,
    write: &TraceWrite,
    pricing: &PricingTable,
) -> Result<TraceRow, StoreError> {
    let metadata = json_or_empty(write.metadata.as_ref().filter(|v| !json_is_empty(v)));
    let (usage_keys, usage_values) = usage_to_arrays(write.usage.as_ref());

    let cost_inputs = CostInputs {
        model: "",
        provider: "",
        usage_keys: &usage_keys,
        usage_values: &usage_values,
        metadata: &metadata,
    };
    let (cost, cost_version) = resolve_cost(
        None,
        write.total_estimated_cost,
        &cost_inputs,
        true,
        pricing,
    )?;

    Ok(TraceRow {
        workspace_id: ctx.workspace_id.clone(),
        project_id: ctx.project_id,
        id,
        name: write.name.clone(),
        start_time: nanos(&write.start_time),
        end_time: write.end_time.as_ref().map(nanos),
        input: json_or_empty(write.input.as_ref().filter(|v| !json_is_empty(v))),
        output: json_or_empty(write.output.as_ref().filter(|v| !json_is_empty(v))),
        metadata,
        tags: write.tags.clone().unwrap_or_default(),
        usage_keys,
        usage_values,
        error_info: error_info_or_empty(write.error_info.as_ref()),
        thread_id: str_or_empty(write.thread_id.as_deref().filter(|s| !is_blank(s))),
        total_estimated_cost: cost,
        total_estimated_cost_version: cost_version,
        created_at: nanos(&ctx.now),
        created_by: ctx.username.clone(),
        last_updated_at: effective_version(write.last_updated_at.as_ref(), &ctx.now),
        last_updated_by: ctx.username.clone(),
    })
}

pub fn update_trace(
    existing: Option<&TraceRow>,
    ctx: &WriteContext,
    id: Uuid,
    update: &TraceUpdate,
    pricing: &PricingTable,
) -> Result<WriteOutcome<TraceRow>, StoreError> {
    let Some(stored) = existing else {
        return Ok(WriteOutcome::Write(shadow_trace_row(ctx, id, update, pricing)?));
    };

    if stored.project_id != ctx.project_id {
        return Err(StoreError::conflict(CONFLICT_PROJECT_TRACE));
    }

    let version = effective_version(update.last_updated_at.as_ref(), &ctx.now);
    if version <= stored.last_updated_at {
        return Ok(WriteOutcome::Stale);
    }

    let metadata = merge_json_patch(&stored.metadata, &update.metadata);
    let (usage_keys, usage_values) =
        merge_usage_patch((&stored.usage_keys, &stored.usage_values), &update.usage);

    let cost_inputs = CostInputs {
        model: "",
        provider: "",
        usage_keys: &usage_keys,
        usage_values: &usage_values,
        metadata: &metadata,
    };
    let inputs_changed = cost_inputs.changed_from_trace(stored);
    let (cost, cost_version) = resolve_cost(
        Some((stored.total_estimated_cost, &stored.total_estimated_cost_version)),
        update.total_estimated_cost,
        &cost_inputs,
        inputs_changed,
        pricing,
    )?;

    Ok(WriteOutcome::Write(TraceRow {
        workspace_id: ctx.workspace_id.clone(),
        project_id: ctx.project_id,
        id,
        name: merge_string(&stored.name, update.name.as_deref()),
        start_time: stored.start_time,
        end_time: match &update.end_time {
            Patch::Set(end) => Some(nanos(end)),
            _ => stored.end_time,
        },
        input: merge_json_patch(&stored.input, &update.input),
        output: merge_json_patch(&stored.output, &update.output),
        metadata,
        tags: merge_tags_patch(&stored.tags, &update.tags),
        usage_keys,
        usage_values,
        error_info: match &update.error_info {
            Patch::Set(info) => error_info_or_empty(Some(info)),
            Patch::Null => String::new(),
            Patch::Absent => stored.error_info.clone(),
        },
        thread_id: merge_string(&stored.thread_id, update.thread_id.as_deref()),
        total_estimated_cost: cost,
        total_estimated_cost_version: cost_version,
        created_at: stored.created_at,
        created_by: if stored.created_by.is_empty() {
            ctx.username.clone()
        } else {
            stored.created_by.clone()
        },
        last_updated_at: version,
        last_updated_by: ctx.username.clone(),
    }))
}

fn shadow_trace_row(
    ctx: &WriteContext,
    id: Uuid,
    update: &TraceUpdate,
    pricing: &PricingTable,
) -> Result<TraceRow, StoreError> {
    let metadata = merge_json_patch("", &update.metadata);
    let (usage_keys, usage_values) = merge_usage_patch((&[], &[]), &update.usage);

    let cost_inputs = CostInputs {
        model: "",
        provider: "",
        usage_keys: &usage_keys,
        usage_values: &usage_values,
        metadata: &metadata,
    };
    let (cost, cost_version) = resolve_cost(
        None,
        update.total_estimated_cost,
        &cost_inputs,
        true,
        pricing,
    )?;

    Ok(TraceRow {
        workspace_id: ctx.workspace_id.clone(),
        project_id: ctx.project_id,
        id,
        name: str_or_empty(update.name.as_deref().filter(|s| !is_blank(s))),
        start_time: 0,
        end_time: update.end_time.as_set().map(nanos),
        input: merge_json_patch("", &update.input),
        output: merge_json_patch("", &update.output),
        metadata,
        tags: merge_tags_patch(&[], &update.tags),
        usage_keys,
        usage_values,
        error_info: match &update.error_info {
            Patch::Set(info) => error_info_or_empty(Some(info)),
            _ => String::new(),
        },
        thread_id: str_or_empty(update.thread_id.as_deref().filter(|s| !is_blank(s))),
        total_estimated_cost: cost,
        total_estimated_cost_version: cost_version,
        created_at: nanos(&ctx.now),
        created_by: ctx.username.clone(),
        last_updated_at: effective_version(update.last_updated_at.as_ref(), &ctx.now),
        last_updated_by: ctx.username.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use traceloom_core::ids;
    use traceloom_core::time;
    use traceloom_core::types::SpanType;

    fn ctx() -> WriteContext {
        WriteContext {
            workspace_id: "ws-1".to_string(),
            project_id: ids::new_v7(),
            username: "tester".to_string(),
            now: time::parse_rfc3339_utc("2024-06-01T12:00:00Z").unwrap(),
        }
    }

    fn later(ctx: &WriteContext) -> WriteContext {
        WriteContext {
            now: ctx.now + chrono::Duration::seconds(10),
            ..ctx.clone()
        }
    }

    fn span_write(trace_id: Uuid) -> SpanWrite {
        SpanWrite {
            id: None,
            project_name: None,
            trace_id,
            parent_span_id: None,
            name: "root".to_string(),
            span_type: SpanType::General,
            start_time: time::parse_rfc3339_utc("2024-01-01T00:00:00Z").unwrap(),
            end_time: Some(time::parse_rfc3339_utc("2024-01-01T00:00:01Z").unwrap()),
            input: None,
            output: Some(json!({"a": 2})),
            metadata: None,
            model: None,
            provider: None,
            tags: None,
            usage: None,
            error_info: None,
            thread_id: None,
            total_estimated_cost: None,
            last_updated_at: None,
        }
    }

    fn update_with_input(trace_id: Uuid, parent: Uuid) -> SpanUpdate {
        SpanUpdate {
            trace_id: Some(trace_id),
            parent_span_id: Some(parent),
            input: Patch::Set(json!({"q": 1})),
            ..Default::default()
        }
    }

    #[test]
    fn update_then_create_merges_into_the_shadow_row() {
        let ctx0 = ctx();
        let pricing = PricingTable::default();
        let id = ids::new_v7();
        let trace_id = ids::new_v7();
        let parent = ids::new_v7();

        let WriteOutcome::Write(shadow) = update_span(
            None,
            &ctx0,
            id,
            &update_with_input(trace_id, parent),
            &pricing,
        )
        .unwrap() else {
            panic!("shadow write expected")
        };
        assert_eq!(shadow.start_time, 0);
        assert_eq!(shadow.input, json!({"q": 1}).to_string());

        let WriteOutcome::Write(merged) =
            create_span(Some(&shadow), &later(&ctx0), id, &span_write(trace_id), &pricing)
                .unwrap()
        else {
            panic!("merge expected")
        };
        assert_eq!(merged.input, json!({"q": 1}).to_string());
        assert_eq!(merged.output, json!({"a": 2}).to_string());
        assert_eq!(merged.name, "root");
        let span = merged.into_span();
        assert_eq!(span.duration, Some(1000.0));
    }

    #[test]
    fn conflicting_trace_id_is_rejected() {
        let ctx0 = ctx();
        let pricing = PricingTable::default();
        let id = ids::new_v7();
        let trace_id = ids::new_v7();
        let parent = ids::new_v7();

        let WriteOutcome::Write(shadow) = update_span(
            None,
            &ctx0,
            id,
            &update_with_input(trace_id, parent),
            &pricing,
        )
        .unwrap() else {
            panic!()
        };

        let err = create_span(
            Some(&shadow),
            &later(&ctx0),
            id,
            &span_write(ids::new_v7()),
            &pricing,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(msg) if msg == CONFLICT_TRACE_ID));
    }

    #[test]
    fn project_divergence_is_rejected() {
        let ctx0 = ctx();
        let pricing = PricingTable::default();
        let id = ids::new_v7();
        let trace_id = ids::new_v7();

        let WriteOutcome::Write(row) =
            create_span(None, &ctx0, id, &span_write(trace_id), &pricing).unwrap()
        else {
            panic!()
        };

        let mut other = later(&ctx0);
        other.project_id = ids::new_v7();
        let err = create_span(Some(&row), &other, id, &span_write(trace_id), &pricing)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(msg) if msg == CONFLICT_PROJECT_SPAN));
    }

    #[test]
    fn stale_writes_are_dropped_silently() {
        let ctx0 = ctx();
        let pricing = PricingTable::default();
        let id = ids::new_v7();
        let trace_id = ids::new_v7();

        let mut newer = span_write(trace_id);
        newer.last_updated_at = Some(ctx0.now + chrono::Duration::seconds(100));
        let WriteOutcome::Write(row) = create_span(None, &ctx0, id, &newer, &pricing).unwrap()
        else {
            panic!()
        };

        let mut older = SpanUpdate {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        older.last_updated_at = Some(ctx0.now + chrono::Duration::seconds(50));
        let outcome = update_span(Some(&row), &later(&ctx0), id, &older, &pricing).unwrap();
        assert!(matches!(outcome, WriteOutcome::Stale));
    }

    #[test]
    fn emptiness_does_not_overwrite_but_null_clears() {
        let ctx0 = ctx();
        let pricing = PricingTable::default();
        let id = ids::new_v7();
        let trace_id = ids::new_v7();

        let mut write = span_write(trace_id);
        write.tags = Some(vec!["keep".to_string()]);
        write.metadata = Some(json!({"k": "v"}));
        let WriteOutcome::Write(row) = create_span(None, &ctx0, id, &write, &pricing).unwrap()
        else {
            panic!()
        };

        // Empty collections leave stored values alone.
        let noop = SpanUpdate {
            tags: Patch::Set(vec![]),
            metadata: Patch::Set(json!({})),
            ..Default::default()
        };
        let WriteOutcome::Write(kept) =
            update_span(Some(&row), &later(&ctx0), id, &noop, &pricing).unwrap()
        else {
            panic!()
        };
        assert_eq!(kept.tags, vec!["keep".to_string()]);
        assert_eq!(kept.metadata, json!({"k": "v"}).to_string());

        // Explicit null clears.
        let clear = SpanUpdate {
            tags: Patch::Null,
            metadata: Patch::Null,
            ..Default::default()
        };
        let mut ctx2 = later(&ctx0);
        ctx2.now = ctx2.now + chrono::Duration::seconds(10);
        let WriteOutcome::Write(cleared) =
            update_span(Some(&kept), &ctx2, id, &clear, &pricing).unwrap()
        else {
            panic!()
        };
        assert!(cleared.tags.is_empty());
        assert!(cleared.metadata.is_empty());
    }

    #[test]
    fn cost_is_recomputed_when_usage_changes() {
        let ctx0 = ctx();
        let pricing = PricingTable::default();
        let id = ids::new_v7();
        let trace_id = ids::new_v7();

        let mut write = span_write(trace_id);
        write.model = Some("gpt-4o".to_string());
        write.provider = Some("openai".to_string());
        write.usage = Some(
            [
                ("original_usage.prompt_tokens".to_string(), 1_000i64),
                ("original_usage.completion_tokens".to_string(), 500),
            ]
            .into_iter()
            .collect(),
        );
        let WriteOutcome::Write(row) = create_span(None, &ctx0, id, &write, &pricing).unwrap()
        else {
            panic!()
        };
        assert!((row.total_estimated_cost - 0.0075).abs() < 1e-12);
        assert_eq!(row.total_estimated_cost_version, pricing.version());

        let bump = SpanUpdate {
            usage: Patch::Set(
                [
                    ("original_usage.prompt_tokens".to_string(), 2_000i64),
                    ("original_usage.completion_tokens".to_string(), 1_000),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        };
        let WriteOutcome::Write(updated) =
            update_span(Some(&row), &later(&ctx0), id, &bump, &pricing).unwrap()
        else {
            panic!()
        };
        assert!((updated.total_estimated_cost - 0.015).abs() < 1e-12);
    }

    #[test]
    fn manual_cost_survives_recomputation() {
        let ctx0 = ctx();
        let pricing = PricingTable::default();
        let id = ids::new_v7();
        let trace_id = ids::new_v7();

        let mut write = span_write(trace_id);
        write.model = Some("gpt-4o".to_string());
        write.provider = Some("openai".to_string());
        write.total_estimated_cost = Some(rust_decimal_macros::dec!(9.5));
        let WriteOutcome::Write(row) = create_span(None, &ctx0, id, &write, &pricing).unwrap()
        else {
            panic!()
        };
        assert_eq!(row.total_estimated_cost, 9.5);
        assert!(row.total_estimated_cost_version.is_empty());

        let bump = SpanUpdate {
            usage: Patch::Set(
                [("original_usage.prompt_tokens".to_string(), 1_000i64)]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        let WriteOutcome::Write(updated) =
            update_span(Some(&row), &later(&ctx0), id, &bump, &pricing).unwrap()
        else {
            panic!()
        };
        assert_eq!(updated.total_estimated_cost, 9.5);
    }

    #[test]
    fn trace_shadow_materializes() {
        let ctx0 = ctx();
        let pricing = PricingTable::default();
        let id = ids::new_v7();

        let update = TraceUpdate {
            input: Patch::Set(json!({"question": "why"})),
            ..Default::default()
        };
        let WriteOutcome::Write(shadow) =
            update_trace(None, &ctx0, id, &update, &pricing).unwrap()
        else {
            panic!()
        };
        assert_eq!(shadow.start_time, 0);

        let write = TraceWrite {
            id: Some(id),
            project_name: None,
            name: "invocation".to_string(),
            start_time: time::parse_rfc3339_utc("2024-01-01T00:00:00Z").unwrap(),
            end_time: None,
            input: None,
            output: None,
            metadata: None,
            tags: None,
            usage: None,
            error_info: None,
            thread_id: None,
            total_estimated_cost: None,
            last_updated_at: None,
        };
        let WriteOutcome::Write(merged) =
            create_trace(Some(&shadow), &later(&ctx0), id, &write, &pricing).unwrap()
        else {
            panic!()
        };
        assert_eq!(merged.name, "invocation");
        assert_eq!(merged.input, json!({"question": "why"}).to_string());
        assert_ne!(merged.start_time, 0);
    }
}
