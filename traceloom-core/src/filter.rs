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

//! Filter and sorting DSL.
//!
//! Filters arrive as a JSON array of `{field, operator, value, key?}`
//! clauses. Validation runs in two passes: operator-for-field-type first,
//! then value/key shape, each with its own error message. Rendering the
//! validated clauses into SQL happens in the storage crate.

use serde::{Deserialize, Serialize};

use crate::time;

/// Semantic type of a filterable field; decides which operators apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    DateTime,
    List,
    Dictionary,
    FeedbackScoresNumber,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::DateTime => "date_time",
            FieldKind::List => "list",
            FieldKind::Dictionary => "dictionary",
            FieldKind::FeedbackScoresNumber => "feedback_scores_number",
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
    #[serde(rename = "starts_with")]
    StartsWith,
    #[serde(rename = "ends_with")]
    EndsWith,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanEqual,
    #[serde(rename = "is_empty")]
    IsEmpty,
    #[serde(rename = "is_not_empty")]
    IsNotEmpty,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::NotEqual => "!=",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::GreaterThan => ">",
            Operator::GreaterThanEqual => ">=",
            Operator::LessThan => "<",
            Operator::LessThanEqual => "<=",
            Operator::IsEmpty => "is_empty",
            Operator::IsNotEmpty => "is_not_empty",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which entity's field table a filter is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterEntity {
    Trace,
    Span,
}

/// One clause of the filter DSL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("Unknown filter field '{0}'")]
    UnknownField(String),
    #[error("Invalid operator '{operator}' for field '{field}' of type '{kind}'")]
    InvalidOperator {
        operator: Operator,
        field: String,
        kind: FieldKindDisplay,
    },
    #[error("Invalid value '{value}' or key '{key}' for field '{field}' of type '{kind}'")]
    InvalidValue {
        value: String,
        key: String,
        field: String,
        kind: FieldKindDisplay,
    },
}

/// Wrapper so thiserror renders the lowercase wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldKindDisplay(pub FieldKind);

impl std::fmt::Display for FieldKindDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Resolve a field name to its kind for the given entity, or `None` when the
/// field is not filterable.
pub fn field_kind(entity: FilterEntity, field: &str) -> Option<FieldKind> {
    if let Some(rest) = field.strip_prefix("usage.") {
        if !rest.is_empty() {
            return Some(FieldKind::Number);
        }
        return None;
    }
    match field {
        "id" | "name" | "input" | "output" | "thread_id" => Some(FieldKind::String),
        "model" | "provider" if entity == FilterEntity::Span => Some(FieldKind::String),
        "duration" | "total_estimated_cost" => Some(FieldKind::Number),
        "start_time" | "end_time" | "created_at" | "last_updated_at" => Some(FieldKind::DateTime),
        "tags" => Some(FieldKind::List),
        "metadata" => Some(FieldKind::Dictionary),
        "feedback_scores" => Some(FieldKind::FeedbackScoresNumber),
        _ => None,
    }
}

fn operator_allowed(kind: FieldKind, op: Operator) -> bool {
    use Operator::*;
    match kind {
        FieldKind::String => matches!(
            op,
            Equal | NotEqual | Contains | NotContains | StartsWith | EndsWith
        ),
        FieldKind::Number | FieldKind::DateTime => matches!(
            op,
            Equal | NotEqual | GreaterThan | GreaterThanEqual | LessThan | LessThanEqual
        ),
        FieldKind::List => matches!(op, Contains),
        FieldKind::Dictionary => {
            matches!(op, Equal | NotEqual | Contains | GreaterThan | LessThan)
        }
        FieldKind::FeedbackScoresNumber => matches!(
            op,
            Equal
                | NotEqual
                | GreaterThan
                | GreaterThanEqual
                | LessThan
                | LessThanEqual
                | IsEmpty
                | IsNotEmpty
        ),
    }
}

/// Validate a single clause: operator first, then value/key shape.
pub fn validate_clause(entity: FilterEntity, clause: &FilterClause) -> Result<FieldKind, FilterError> {
    let kind = field_kind(entity, &clause.field)
        .ok_or_else(|| FilterError::UnknownField(clause.field.clone()))?;

    if !operator_allowed(kind, clause.operator) {
        return Err(FilterError::InvalidOperator {
            operator: clause.operator,
            field: clause.field.clone(),
            kind: FieldKindDisplay(kind),
        });
    }

    let value_ok = match kind {
        FieldKind::String | FieldKind::List => !clause.value.trim().is_empty(),
        FieldKind::Number => clause.value.trim().parse::<f64>().is_ok(),
        FieldKind::DateTime => time::parse_rfc3339_utc(clause.value.trim()).is_ok(),
        FieldKind::Dictionary => {
            !clause.value.trim().is_empty() && key_is_resolvable(clause.key.as_deref())
        }
        FieldKind::FeedbackScoresNumber => {
            let key_ok = clause
                .key
                .as_deref()
                .map(|k| !k.trim().is_empty())
                .unwrap_or(false);
            let value_ok = matches!(clause.operator, Operator::IsEmpty | Operator::IsNotEmpty)
                || clause.value.trim().parse::<f64>().is_ok();
            key_ok && value_ok
        }
    };

    if !value_ok {
        return Err(FilterError::InvalidValue {
            value: clause.value.clone(),
            key: clause.key.clone().unwrap_or_default(),
            field: clause.field.clone(),
            kind: FieldKindDisplay(kind),
        });
    }

    Ok(kind)
}

/// Validate a whole filter list, failing on the first bad clause.
pub fn validate_filters(
    entity: FilterEntity,
    filters: &[FilterClause],
) -> Result<(), FilterError> {
    for clause in filters {
        validate_clause(entity, clause)?;
    }
    Ok(())
}

fn key_is_resolvable(key: Option<&str>) -> bool {
    key.map(|k| parse_key_path(k).is_some()).unwrap_or(false)
}

/// One step of a JSONPath-lite dictionary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(u32),
}

/// Parse `$.a.b[0]` / `a.b[0]` into segments; both spellings are equivalent.
pub fn parse_key_path(raw: &str) -> Option<Vec<PathSegment>> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("$.").or_else(|| raw.strip_prefix('$')).unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }

    let mut segments = Vec::new();
    for part in raw.split('.') {
        if part.is_empty() {
            return None;
        }
        let mut rest = part;
        // leading name, if any
        if !rest.starts_with('[') {
            let name_end = rest.find('[').unwrap_or(rest.len());
            let (name, tail) = rest.split_at(name_end);
            segments.push(PathSegment::Key(name.to_string()));
            rest = tail;
        }
        // zero or more [n] suffixes
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let idx: u32 = stripped[..close].parse().ok()?;
            segments.push(PathSegment::Index(idx));
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(segments)
}

/// Sorting direction; the wire accepts both cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    #[serde(rename = "ASC", alias = "asc")]
    Asc,
    #[serde(rename = "DESC", alias = "desc")]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortClause {
    pub field: String,
    #[serde(default = "default_direction")]
    pub direction: SortDirection,
}

fn default_direction() -> SortDirection {
    SortDirection::Asc
}

/// Closed set of sortable columns.
pub fn sortable(field: &str) -> bool {
    matches!(
        field,
        "id" | "name"
            | "start_time"
            | "end_time"
            | "duration"
            | "total_estimated_cost"
            | "created_at"
            | "last_updated_at"
    )
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid sorting field '{0}'")]
pub struct SortError(pub String);

pub fn validate_sorting(sorting: &[SortClause]) -> Result<(), SortError> {
    for clause in sorting {
        if !sortable(&clause.field) {
            return Err(SortError(clause.field.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clause(field: &str, operator: Operator, value: &str) -> FilterClause {
        FilterClause {
            field: field.to_string(),
            operator,
            key: None,
            value: value.to_string(),
        }
    }

    #[test]
    fn contains_on_date_time_renders_the_exact_message() {
        let err =
            validate_clause(FilterEntity::Span, &clause("end_time", Operator::Contains, "x"))
                .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid operator 'contains' for field 'end_time' of type 'date_time'"
        );
    }

    #[test]
    fn operator_is_checked_before_value() {
        // Both the operator and the value are bad; the operator message wins.
        let err = validate_clause(
            FilterEntity::Span,
            &clause("duration", Operator::StartsWith, "not-a-number"),
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::InvalidOperator { .. }));
    }

    #[test]
    fn bad_number_value_renders_the_exact_message() {
        let err = validate_clause(
            FilterEntity::Span,
            &clause("usage.total_tokens", Operator::GreaterThan, "abc"),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value 'abc' or key '' for field 'usage.total_tokens' of type 'number'"
        );
    }

    #[test]
    fn dictionary_requires_a_key() {
        let mut c = clause("metadata", Operator::Equal, "gpt-4o");
        assert!(matches!(
            validate_clause(FilterEntity::Trace, &c),
            Err(FilterError::InvalidValue { .. })
        ));
        c.key = Some("$.model[0].version".to_string());
        assert!(validate_clause(FilterEntity::Trace, &c).is_ok());
    }

    #[test]
    fn feedback_scores_admit_emptiness_checks() {
        let mut c = clause("feedback_scores", Operator::IsEmpty, "");
        c.key = Some("accuracy".to_string());
        assert!(validate_clause(FilterEntity::Trace, &c).is_ok());

        c.operator = Operator::GreaterThan;
        c.value = "0.5".to_string();
        assert!(validate_clause(FilterEntity::Trace, &c).is_ok());

        c.value = "high".to_string();
        assert!(validate_clause(FilterEntity::Trace, &c).is_err());
    }

    #[test]
    fn model_is_span_only() {
        assert_eq!(
            field_kind(FilterEntity::Span, "model"),
            Some(FieldKind::String)
        );
        assert_eq!(field_kind(FilterEntity::Trace, "model"), None);
    }

    #[test]
    fn key_paths_with_and_without_dollar_are_equivalent() {
        assert_eq!(
            parse_key_path("$.a.b[0]"),
            parse_key_path("a.b[0]"),
        );
        assert_eq!(
            parse_key_path("a.b[0]").unwrap(),
            vec![
                PathSegment::Key("a".into()),
                PathSegment::Key("b".into()),
                PathSegment::Index(0)
            ]
        );
        assert!(parse_key_path("").is_none());
        assert!(parse_key_path("a[x]").is_none());
    }

    #[test]
    fn operators_deserialize_from_symbols() {
        let c: FilterClause =
            serde_json::from_str(r#"{"field":"name","operator":">=","value":"x"}"#).unwrap();
        assert_eq!(c.operator, Operator::GreaterThanEqual);
    }

    #[test]
    fn sorting_table_is_closed() {
        assert!(validate_sorting(&[SortClause {
            field: "start_time".into(),
            direction: SortDirection::Desc
        }])
        .is_ok());
        let err = validate_sorting(&[SortClause {
            field: "input".into(),
            direction: SortDirection::Asc
        }])
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid sorting field 'input'");
    }
}
