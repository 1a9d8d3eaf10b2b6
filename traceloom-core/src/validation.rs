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

//! Request validation.
//!
//! One explicit table of checks per payload kind, consulted once per
//! request. Failures accumulate so a response can report every bad field at
//! once instead of the first.

use std::collections::HashSet;

use uuid::Uuid;

use crate::types::{SpanWrite, TraceWrite};

/// Hard cap on batch endpoints (spans, traces, feedback scores).
pub const MAX_BATCH_SIZE: usize = 1000;

/// Accumulates field-level failures for a single request.
#[derive(Debug, Default)]
pub struct FieldErrors {
    errors: Vec<String>,
}

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn check(&mut self, result: Result<(), String>) {
        if let Err(message) = result {
            self.errors.push(message);
        }
    }

    pub fn into_result(self) -> Result<(), Vec<String>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Field checks shared by single and batch span creation. Id version checks
/// are separate because they map to 400 rather than 422.
pub fn validate_span_write(span: &SpanWrite) -> Result<(), Vec<String>> {
    let mut errors = FieldErrors::new();
    if span.name.trim().is_empty() {
        errors.push("name must not be blank");
    }
    if let Some(cost) = span.total_estimated_cost {
        if cost.is_sign_negative() && !cost.is_zero() {
            errors.push("total_estimated_cost must not be negative");
        }
    }
    if let Some(usage) = &span.usage {
        for (key, value) in usage {
            if *value < 0 {
                errors.push(format!("usage.{key} must not be negative"));
            }
        }
    }
    errors.into_result()
}

pub fn validate_trace_write(trace: &TraceWrite) -> Result<(), Vec<String>> {
    let mut errors = FieldErrors::new();
    if trace.name.trim().is_empty() {
        errors.push("name must not be blank");
    }
    if let Some(cost) = trace.total_estimated_cost {
        if cost.is_sign_negative() && !cost.is_zero() {
            errors.push("total_estimated_cost must not be negative");
        }
    }
    if let Some(usage) = &trace.usage {
        for (key, value) in usage {
            if *value < 0 {
                errors.push(format!("usage.{key} must not be negative"));
            }
        }
    }
    errors.into_result()
}

/// Envelope check for batch endpoints.
pub fn check_batch_cap(len: usize, what: &str) -> Result<(), String> {
    if len == 0 {
        return Err(format!("{what} must not be empty"));
    }
    if len > MAX_BATCH_SIZE {
        return Err(format!(
            "{what} size {len} exceeds the maximum of {MAX_BATCH_SIZE}"
        ));
    }
    Ok(())
}

/// First id that appears more than once among the explicitly supplied ids.
pub fn find_duplicate_id<'a>(ids: impl Iterator<Item = Option<&'a Uuid>>) -> Option<Uuid> {
    let mut seen = HashSet::new();
    for id in ids.flatten() {
        if !seen.insert(*id) {
            return Some(*id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn span(name: &str) -> SpanWrite {
        SpanWrite {
            id: None,
            project_name: None,
            trace_id: ids::new_v7(),
            parent_span_id: None,
            name: name.to_string(),
            span_type: Default::default(),
            start_time: Utc::now(),
            end_time: None,
            input: None,
            output: None,
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

    #[test]
    fn errors_accumulate() {
        let mut bad = span("  ");
        bad.total_estimated_cost = Some(dec!(-1));
        bad.usage = Some([("total_tokens".to_string(), -5)].into_iter().collect());
        let errors = validate_span_write(&bad).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn batch_cap_is_inclusive() {
        assert!(check_batch_cap(MAX_BATCH_SIZE, "spans").is_ok());
        assert!(check_batch_cap(MAX_BATCH_SIZE + 1, "spans").is_err());
        assert!(check_batch_cap(0, "spans").is_err());
    }

    #[test]
    fn duplicate_detection_ignores_generated_ids() {
        let id = ids::new_v7();
        let other = ids::new_v7();
        assert_eq!(
            find_duplicate_id([Some(&id), None, Some(&other), Some(&id)].into_iter()),
            Some(id)
        );
        assert_eq!(find_duplicate_id([None, None].into_iter()), None);
    }
}
