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

//! Filter and sort rendering.
//!
//! Validated DSL clauses become WHERE fragments with `?` placeholders plus
//! an ordered bind list; user input never lands in the SQL text itself.
//! Dictionary keys are the one exception: the path is rebuilt from parsed
//! segments, so arbitrary input cannot reach the statement. String
//! comparisons are case-insensitive throughout.

use traceloom_core::filter::{
    parse_key_path, validate_clause, FieldKind, FieldKindDisplay, FilterClause, FilterEntity,
    FilterError, Operator, PathSegment, SortClause,
};
use traceloom_core::time;

use crate::rows::score_to_nanos;

/// One bind parameter, in `?` order.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Str(String),
    F64(f64),
    I64(i64),
}

/// Rendered WHERE fragments (AND-joined) and their binds.
#[derive(Debug, Default)]
pub struct SqlFilter {
    pub conditions: Vec<String>,
    pub binds: Vec<BindValue>,
}

impl SqlFilter {
    /// `AND c1 AND c2 ...`, or nothing.
    pub fn and_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" AND {}", self.conditions.join(" AND "))
        }
    }
}

/// Duration in milliseconds, derived at query time; NULL while open.
pub const DURATION_EXPR: &str = "((end_time - start_time) / 1000000.0)";

fn comparison(op: Operator) -> &'static str {
    match op {
        Operator::Equal => "=",
        Operator::NotEqual => "!=",
        Operator::GreaterThan => ">",
        Operator::GreaterThanEqual => ">=",
        Operator::LessThan => "<",
        Operator::LessThanEqual => "<=",
        // Callers only pass comparison-shaped operators here.
        _ => unreachable!("not a comparison operator"),
    }
}

fn render_string_condition(col: &str, op: Operator, out: &mut SqlFilter, value: &str) {
    match op {
        Operator::Equal | Operator::NotEqual => {
            out.conditions.push(format!(
                "lowerUTF8({col}) {} lowerUTF8(?)",
                comparison(op)
            ));
            out.binds.push(BindValue::Str(value.to_string()));
        }
        Operator::Contains => {
            out.conditions
                .push(format!("positionCaseInsensitive({col}, ?) > 0"));
            out.binds.push(BindValue::Str(value.to_string()));
        }
        Operator::NotContains => {
            out.conditions
                .push(format!("positionCaseInsensitive({col}, ?) = 0"));
            out.binds.push(BindValue::Str(value.to_string()));
        }
        Operator::StartsWith => {
            out.conditions
                .push(format!("startsWith(lowerUTF8({col}), lowerUTF8(?))"));
            out.binds.push(BindValue::Str(value.to_string()));
        }
        Operator::EndsWith => {
            out.conditions
                .push(format!("endsWith(lowerUTF8({col}), lowerUTF8(?))"));
            out.binds.push(BindValue::Str(value.to_string()));
        }
        // Lexicographic ordering for dictionary values.
        Operator::GreaterThan | Operator::LessThan => {
            out.conditions.push(format!(
                "lowerUTF8({col}) {} lowerUTF8(?)",
                comparison(op)
            ));
            out.binds.push(BindValue::Str(value.to_string()));
        }
        _ => unreachable!("operator rejected by validation"),
    }
}

fn string_column(entity: FilterEntity, field: &str) -> Option<&'static str> {
    match field {
        "id" => Some("toString(id)"),
        "name" => Some("name"),
        "input" => Some("input"),
        "output" => Some("output"),
        "thread_id" => Some("thread_id"),
        "model" if entity == FilterEntity::Span => Some("model"),
        "provider" if entity == FilterEntity::Span => Some("provider"),
        _ => None,
    }
}

fn datetime_column(field: &str) -> Option<&'static str> {
    match field {
        "start_time" => Some("start_time"),
        "end_time" => Some("end_time"),
        "created_at" => Some("created_at"),
        "last_updated_at" => Some("last_updated_at"),
        _ => None,
    }
}

/// JSONPath rebuilt from parsed segments; key text never reaches the SQL.
fn json_path(segments: &[PathSegment]) -> String {
    let mut path = String::from("$");
    for segment in segments {
        match segment {
            PathSegment::Key(key) => {
                path.push('.');
                path.push_str(&key.replace(['\'', '"', '\\'], ""));
            }
            PathSegment::Index(idx) => {
                path.push_str(&format!("[{idx}]"));
            }
        }
    }
    path
}

fn invalid_value(clause: &FilterClause, kind: FieldKind) -> FilterError {
    FilterError::InvalidValue {
        value: clause.value.clone(),
        key: clause.key.clone().unwrap_or_default(),
        field: clause.field.clone(),
        kind: FieldKindDisplay(kind),
    }
}

/// Render one validated clause into `out`.
fn render_clause(
    entity: FilterEntity,
    clause: &FilterClause,
    workspace_id: &str,
    out: &mut SqlFilter,
) -> Result<(), FilterError> {
    validate_clause(entity, clause)?;
    let value = clause.value.trim();

    if let Some(key) = clause.field.strip_prefix("usage.") {
        out.conditions.push(format!(
            "usage_values[indexOf(usage_keys, ?)] {} ?",
            comparison(clause.operator)
        ));
        out.binds.push(BindValue::Str(key.to_string()));
        out.binds
            .push(BindValue::F64(value.parse().unwrap_or_default()));
        return Ok(());
    }

    if let Some(col) = string_column(entity, &clause.field) {
        render_string_condition(col, clause.operator, out, value);
        return Ok(());
    }

    if let Some(col) = datetime_column(&clause.field) {
        let instant = time::parse_rfc3339_utc(value)
            .map_err(|_| invalid_value(clause, FieldKind::DateTime))?;
        out.conditions
            .push(format!("{col} {} ?", comparison(clause.operator)));
        out.binds.push(BindValue::I64(time::to_nanos(&instant)));
        return Ok(());
    }

    match clause.field.as_str() {
        "duration" => {
            out.conditions.push(format!(
                "{DURATION_EXPR} {} ?",
                comparison(clause.operator)
            ));
            out.binds
                .push(BindValue::F64(value.parse().unwrap_or_default()));
        }
        "total_estimated_cost" => {
            out.conditions.push(format!(
                "total_estimated_cost {} ?",
                comparison(clause.operator)
            ));
            out.binds
                .push(BindValue::F64(value.parse().unwrap_or_default()));
        }
        "tags" => {
            out.conditions
                .push("arrayExists(t -> positionCaseInsensitive(t, ?) > 0, tags)".to_string());
            out.binds.push(BindValue::Str(value.to_string()));
        }
        "metadata" => {
            let segments = parse_key_path(clause.key.as_deref().unwrap_or_default())
                .ok_or_else(|| invalid_value(clause, FieldKind::Dictionary))?;
            let extract = format!("JSON_VALUE(metadata, '{}')", json_path(&segments));
            let numeric_op = matches!(
                clause.operator,
                Operator::Equal | Operator::NotEqual | Operator::GreaterThan | Operator::LessThan
            );
            if numeric_op && value.parse::<f64>().is_ok() {
                out.conditions.push(format!(
                    "toFloat64OrNull({extract}) {} ?",
                    comparison(clause.operator)
                ));
                out.binds
                    .push(BindValue::F64(value.parse().unwrap_or_default()));
            } else {
                render_string_condition(&extract, clause.operator, out, value);
            }
        }
        "feedback_scores" => {
            let entity_type = match entity {
                FilterEntity::Trace => "trace",
                FilterEntity::Span => "span",
            };
            let subquery = format!(
                "SELECT entity_id FROM feedback_scores \
                 WHERE workspace_id = ? AND entity_type = '{entity_type}' AND name = ?"
            );
            match clause.operator {
                Operator::IsEmpty => {
                    out.conditions.push(format!("id NOT IN ({subquery})"));
                    out.binds.push(BindValue::Str(workspace_id.to_string()));
                    out.binds
                        .push(BindValue::Str(clause.key.clone().unwrap_or_default()));
                }
                Operator::IsNotEmpty => {
                    out.conditions.push(format!("id IN ({subquery})"));
                    out.binds.push(BindValue::Str(workspace_id.to_string()));
                    out.binds
                        .push(BindValue::Str(clause.key.clone().unwrap_or_default()));
                }
                op => {
                    out.conditions.push(format!(
                        "id IN ({subquery} GROUP BY entity_id, name, created_by \
                         HAVING argMax(value_nanos, last_updated_at) {} ?)",
                        comparison(op)
                    ));
                    out.binds.push(BindValue::Str(workspace_id.to_string()));
                    out.binds
                        .push(BindValue::Str(clause.key.clone().unwrap_or_default()));
                    let score: rust_decimal::Decimal = value.parse().unwrap_or_default();
                    out.binds.push(BindValue::I64(score_to_nanos(score)));
                }
            }
        }
        other => {
            // field_kind() already vetted the name inside validate_clause
            unreachable!("unhandled filter field '{other}'")
        }
    }
    Ok(())
}

/// Validate and render a whole filter list.
pub fn render_filters(
    entity: FilterEntity,
    filters: &[FilterClause],
    workspace_id: &str,
) -> Result<SqlFilter, FilterError> {
    let mut out = SqlFilter::default();
    for clause in filters {
        render_clause(entity, clause, workspace_id, &mut out)?;
    }
    Ok(out)
}

fn sort_expr(field: &str) -> &str {
    match field {
        "duration" => DURATION_EXPR,
        other => other,
    }
}

/// Render a validated sort list, always tie-breaking on `id DESC` so paging
/// is stable.
pub fn render_sorting(sorting: &[SortClause]) -> String {
    let mut parts: Vec<String> = sorting
        .iter()
        .map(|s| format!("{} {}", sort_expr(&s.field), s.direction.as_sql()))
        .collect();
    if !sorting.iter().any(|s| s.field == "id") {
        parts.push("id DESC".to_string());
    }
    format!("ORDER BY {}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use traceloom_core::filter::SortDirection;

    fn clause(field: &str, operator: Operator, value: &str) -> FilterClause {
        FilterClause {
            field: field.to_string(),
            operator,
            key: None,
            value: value.to_string(),
        }
    }

    #[test]
    fn string_filters_compare_case_insensitively() {
        let sql = render_filters(
            FilterEntity::Span,
            &[clause("name", Operator::Equal, "Root")],
            "ws",
        )
        .unwrap();
        assert_eq!(sql.conditions, vec!["lowerUTF8(name) = lowerUTF8(?)"]);
        assert_eq!(sql.binds, vec![BindValue::Str("Root".into())]);
    }

    #[test]
    fn usage_filters_bind_the_key_then_the_value() {
        let sql = render_filters(
            FilterEntity::Span,
            &[clause("usage.total_tokens", Operator::GreaterThan, "100")],
            "ws",
        )
        .unwrap();
        assert_eq!(
            sql.conditions,
            vec!["usage_values[indexOf(usage_keys, ?)] > ?"]
        );
        assert_eq!(
            sql.binds,
            vec![
                BindValue::Str("total_tokens".into()),
                BindValue::F64(100.0)
            ]
        );
    }

    #[test]
    fn datetime_filters_bind_nanoseconds() {
        let sql = render_filters(
            FilterEntity::Trace,
            &[clause(
                "start_time",
                Operator::GreaterThanEqual,
                "2024-01-01T00:00:00Z",
            )],
            "ws",
        )
        .unwrap();
        assert_eq!(sql.binds, vec![BindValue::I64(1_704_067_200_000_000_000)]);
    }

    #[test]
    fn metadata_numeric_comparison_uses_float_extraction() {
        let mut c = clause("metadata", Operator::GreaterThan, "3");
        c.key = Some("$.model[0].version".to_string());
        let sql = render_filters(FilterEntity::Trace, &[c], "ws").unwrap();
        assert_eq!(
            sql.conditions,
            vec!["toFloat64OrNull(JSON_VALUE(metadata, '$.model[0].version')) > ?"]
        );
        assert_eq!(sql.binds, vec![BindValue::F64(3.0)]);
    }

    #[test]
    fn metadata_string_comparison_is_lexicographic() {
        let mut c = clause("metadata", Operator::Equal, "TRUE");
        c.key = Some("flags.enabled".to_string());
        let sql = render_filters(FilterEntity::Trace, &[c], "ws").unwrap();
        assert_eq!(
            sql.conditions,
            vec!["lowerUTF8(JSON_VALUE(metadata, '$.flags.enabled')) = lowerUTF8(?)"]
        );
    }

    #[test]
    fn dictionary_key_quotes_cannot_escape_the_path_literal() {
        let mut c = clause("metadata", Operator::Equal, "x");
        c.key = Some("a'); DROP TABLE spans; --".to_string());
        let sql = render_filters(FilterEntity::Trace, &[c], "ws").unwrap();
        // Only the two delimiters of the path literal survive.
        let quotes = sql.conditions[0].matches('\'').count();
        assert_eq!(quotes, 2);
    }

    #[test]
    fn feedback_score_filters_use_a_latest_version_subquery() {
        let mut c = clause("feedback_scores", Operator::GreaterThanEqual, "0.5");
        c.key = Some("accuracy".to_string());
        let sql = render_filters(FilterEntity::Span, &[c], "ws-1").unwrap();
        assert!(sql.conditions[0].contains("argMax(value_nanos, last_updated_at) >= ?"));
        assert_eq!(
            sql.binds,
            vec![
                BindValue::Str("ws-1".into()),
                BindValue::Str("accuracy".into()),
                BindValue::I64(500_000_000)
            ]
        );
    }

    #[test]
    fn is_empty_renders_not_in() {
        let mut c = clause("feedback_scores", Operator::IsEmpty, "");
        c.key = Some("accuracy".to_string());
        let sql = render_filters(FilterEntity::Span, &[c], "ws").unwrap();
        assert!(sql.conditions[0].starts_with("id NOT IN"));
    }

    #[test]
    fn invalid_clause_surfaces_the_filter_error() {
        let err = render_filters(
            FilterEntity::Span,
            &[clause("end_time", Operator::Contains, "x")],
            "ws",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid operator 'contains' for field 'end_time' of type 'date_time'"
        );
    }

    #[test]
    fn sorting_appends_id_tiebreak() {
        let rendered = render_sorting(&[SortClause {
            field: "start_time".into(),
            direction: SortDirection::Desc,
        }]);
        assert_eq!(rendered, "ORDER BY start_time DESC, id DESC");
    }

    #[test]
    fn duration_sort_uses_the_derived_expression() {
        let rendered = render_sorting(&[SortClause {
            field: "duration".into(),
            direction: SortDirection::Asc,
        }]);
        assert!(rendered.contains(DURATION_EXPR));
    }
}
