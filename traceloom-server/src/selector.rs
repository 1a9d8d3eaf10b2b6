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

//! Column projection for list and search responses: the `exclude` query
//! parameter zeroes unwanted fields. The allowed set is closed; anything
//! else is a 400.

use std::str::FromStr;

use traceloom_core::types::{Span, Trace};

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcludableField {
    Name,
    Type,
    StartTime,
    EndTime,
    Input,
    Output,
    Metadata,
    Model,
    Provider,
    Tags,
    Usage,
    ErrorInfo,
    CreatedAt,
    CreatedBy,
    LastUpdatedBy,
    FeedbackScores,
    Comments,
    TotalEstimatedCost,
    TotalEstimatedCostVersion,
    Duration,
}

impl FromStr for ExcludableField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ExcludableField::*;
        Ok(match s {
            "name" => Name,
            "type" => Type,
            "start_time" => StartTime,
            "end_time" => EndTime,
            "input" => Input,
            "output" => Output,
            "metadata" => Metadata,
            "model" => Model,
            "provider" => Provider,
            "tags" => Tags,
            "usage" => Usage,
            "error_info" => ErrorInfo,
            "created_at" => CreatedAt,
            "created_by" => CreatedBy,
            "last_updated_by" => LastUpdatedBy,
            "feedback_scores" => FeedbackScores,
            "comments" => Comments,
            "total_estimated_cost" => TotalEstimatedCost,
            "total_estimated_cost_version" => TotalEstimatedCostVersion,
            "duration" => Duration,
            other => return Err(format!("Field '{other}' is not excludable")),
        })
    }
}

/// Parse the comma-separated `exclude` parameter.
pub fn parse_exclude(raw: Option<&str>) -> Result<Vec<ExcludableField>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| ExcludableField::from_str(s).map_err(ApiError::BadRequest))
        .collect()
}

pub fn apply_to_span(span: &mut Span, exclude: &[ExcludableField]) {
    for field in exclude {
        match field {
            ExcludableField::Name => span.name = None,
            ExcludableField::Type => span.span_type = None,
            ExcludableField::StartTime => span.start_time = None,
            ExcludableField::EndTime => span.end_time = None,
            ExcludableField::Input => span.input = None,
            ExcludableField::Output => span.output = None,
            ExcludableField::Metadata => span.metadata = None,
            ExcludableField::Model => span.model = None,
            ExcludableField::Provider => span.provider = None,
            ExcludableField::Tags => span.tags = None,
            ExcludableField::Usage => span.usage = None,
            ExcludableField::ErrorInfo => span.error_info = None,
            ExcludableField::CreatedAt => span.created_at = None,
            ExcludableField::CreatedBy => span.created_by = None,
            ExcludableField::LastUpdatedBy => span.last_updated_by = None,
            ExcludableField::FeedbackScores => span.feedback_scores = None,
            ExcludableField::Comments => span.comments = None,
            ExcludableField::TotalEstimatedCost => span.total_estimated_cost = None,
            ExcludableField::TotalEstimatedCostVersion => {
                span.total_estimated_cost_version = None
            }
            ExcludableField::Duration => span.duration = None,
        }
    }
}

pub fn apply_to_trace(trace: &mut Trace, exclude: &[ExcludableField]) {
    for field in exclude {
        match field {
            ExcludableField::Name => trace.name = None,
            ExcludableField::StartTime => trace.start_time = None,
            ExcludableField::EndTime => trace.end_time = None,
            ExcludableField::Input => trace.input = None,
            ExcludableField::Output => trace.output = None,
            ExcludableField::Metadata => trace.metadata = None,
            ExcludableField::Tags => trace.tags = None,
            ExcludableField::Usage => trace.usage = None,
            ExcludableField::ErrorInfo => trace.error_info = None,
            ExcludableField::CreatedAt => trace.created_at = None,
            ExcludableField::CreatedBy => trace.created_by = None,
            ExcludableField::LastUpdatedBy => trace.last_updated_by = None,
            ExcludableField::FeedbackScores => trace.feedback_scores = None,
            ExcludableField::Comments => trace.comments = None,
            ExcludableField::TotalEstimatedCost => trace.total_estimated_cost = None,
            ExcludableField::TotalEstimatedCostVersion => {
                trace.total_estimated_cost_version = None
            }
            ExcludableField::Duration => trace.duration = None,
            // Span-only columns; nothing to clear on a trace.
            ExcludableField::Type | ExcludableField::Model | ExcludableField::Provider => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_exclusion_set_is_closed() {
        assert!(parse_exclude(Some("input,output, usage")).is_ok());
        let err = parse_exclude(Some("id")).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(msg) if msg.contains("'id'")));
        assert!(parse_exclude(None).unwrap().is_empty());
    }

    #[test]
    fn excluded_fields_are_zeroed_on_the_span() {
        let id = traceloom_core::ids::new_v7();
        let raw = format!(
            r#"{{"id":"{id}","project_id":"{id}","trace_id":"{id}",
                "name":"root","input":{{"q":1}},"duration":12.5,
                "last_updated_at":"2024-01-01T00:00:00Z"}}"#
        );
        let mut span: Span = serde_json::from_str(&raw).unwrap();
        apply_to_span(
            &mut span,
            &[ExcludableField::Input, ExcludableField::Duration],
        );
        assert!(span.input.is_none());
        assert!(span.duration.is_none());
        assert_eq!(span.name.as_deref(), Some("root"));
    }
}
