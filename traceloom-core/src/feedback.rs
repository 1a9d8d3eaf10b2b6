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

//! Feedback scores.
//!
//! A score is keyed `(entity_id, name, author)`; writing the same key again
//! replaces the previous value outright.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time;

/// Largest admissible score magnitude: nine integer and nine decimal digits.
pub const SCORE_MAX: Decimal = dec!(999_999_999.999999999);
/// Maximum decimal places kept on a score value.
pub const SCORE_SCALE: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    Sdk,
    Ui,
    OnlineScoring,
}

impl ScoreSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreSource::Sdk => "sdk",
            ScoreSource::Ui => "ui",
            ScoreSource::OnlineScoring => "online_scoring",
        }
    }
}

impl std::str::FromStr for ScoreSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sdk" => Ok(ScoreSource::Sdk),
            "ui" => Ok(ScoreSource::Ui),
            "online_scoring" => Ok(ScoreSource::OnlineScoring),
            other => Err(format!("unknown score source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackScore {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    pub value: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub source: ScoreSource,
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "time::rfc3339_opt", skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_by: Option<String>,
}

/// One item of a feedback-score batch; the entity is addressed by id and
/// scoped by project name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackScoreBatchItem {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    pub value: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub source: ScoreSource,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackScoreBatch {
    pub scores: Vec<FeedbackScoreBatchItem>,
}

/// Body for deleting a score by name (and optionally author).
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteFeedbackScore {
    pub name: String,
    #[serde(default)]
    pub author: Option<String>,
}

/// Range and scale check shared by the single and batch endpoints.
pub fn validate_score_value(value: &Decimal) -> Result<(), String> {
    if value.abs() > SCORE_MAX {
        return Err(format!(
            "value '{value}' must be between {} and {}",
            -SCORE_MAX, SCORE_MAX
        ));
    }
    if value.scale() > SCORE_SCALE {
        return Err(format!(
            "value '{value}' must not have more than {SCORE_SCALE} decimal places"
        ));
    }
    Ok(())
}

pub fn validate_score_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("name must not be blank".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn accepts_extremes_and_rejects_beyond() {
        assert!(validate_score_value(&SCORE_MAX).is_ok());
        assert!(validate_score_value(&-SCORE_MAX).is_ok());
        assert!(validate_score_value(&dec!(1_000_000_000)).is_err());
        assert!(validate_score_value(&Decimal::from_scientific("1e10").unwrap()).is_err());
    }

    #[test]
    fn rejects_excess_scale() {
        let ten_places = Decimal::from_str("0.0000000001").unwrap();
        assert!(validate_score_value(&ten_places).is_err());
        let nine_places = Decimal::from_str("0.000000001").unwrap();
        assert!(validate_score_value(&nine_places).is_ok());
    }

    #[test]
    fn blank_names_are_rejected() {
        assert!(validate_score_name("  ").is_err());
        assert!(validate_score_name("accuracy").is_ok());
    }

    #[test]
    fn source_wire_names() {
        assert_eq!(
            serde_json::to_string(&ScoreSource::OnlineScoring).unwrap(),
            "\"online_scoring\""
        );
        assert_eq!(ScoreSource::from_str("ui").unwrap(), ScoreSource::Ui);
    }
}
