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

//! Aggregate statistics over a filtered scope: counts, duration
//! percentiles, cost totals, per-key usage, per-name feedback scores, and
//! string-field cardinalities.

use clickhouse::Row;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use traceloom_core::cost::floor_to_cost_scale;

use crate::client::StoreClient;
use crate::error::StoreError;
use crate::spans::bind_all;
use crate::sql::{BindValue, DURATION_EXPR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsTarget {
    Spans,
    Traces,
}

impl StatsTarget {
    fn entity_type(&self) -> &'static str {
        match self {
            StatsTarget::Spans => "span",
            StatsTarget::Traces => "trace",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DurationStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p90: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageStat {
    pub name: String,
    pub sum: i64,
    pub avg: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackScoreStat {
    pub name: String,
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CardinalityStats {
    pub name: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub count: u64,
    pub duration: DurationStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_estimated_cost_sum: Option<Decimal>,
    pub usage: Vec<UsageStat>,
    pub feedback_scores: Vec<FeedbackScoreStat>,
    pub cardinality: CardinalityStats,
}

#[derive(Debug, Row, Deserialize)]
struct AggregateRow {
    count: u64,
    duration_p50: Option<f64>,
    duration_p90: Option<f64>,
    duration_p99: Option<f64>,
    duration_avg: Option<f64>,
    cost_sum: f64,
    name_cardinality: u64,
    model_cardinality: u64,
    provider_cardinality: u64,
}

#[derive(Debug, Row, Deserialize)]
struct UsageStatRow {
    name: String,
    sum: i64,
    avg: f64,
}

#[derive(Debug, Row, Deserialize)]
struct FeedbackStatRow {
    name: String,
    min: f64,
    avg: f64,
    max: f64,
}

/// Run the three aggregate queries over `inner` (the latest-version
/// subquery) restricted by the rendered filter tail.
pub async fn collect(
    client: &StoreClient,
    target: StatsTarget,
    workspace_id: &str,
    inner: &str,
    filter_tail: &str,
    binds: &[BindValue],
) -> Result<StatsSummary, StoreError> {
    let cardinality_columns = match target {
        StatsTarget::Spans => "uniqExact(name), uniqExact(model), uniqExact(provider)",
        StatsTarget::Traces => "uniqExact(name), toUInt64(0), toUInt64(0)",
    };
    let aggregate_sql = format!(
        "SELECT count(), \
                quantile(0.5)({DURATION_EXPR}), \
                quantile(0.9)({DURATION_EXPR}), \
                quantile(0.99)({DURATION_EXPR}), \
                avg({DURATION_EXPR}), \
                sum(total_estimated_cost), \
                {cardinality_columns} \
         FROM ({inner}) WHERE 1 = 1{filter_tail}"
    );
    let aggregate = client
        .with_retries("stats.aggregate", |c| {
            let query = bind_all(c.query(&aggregate_sql), binds);
            async move { query.fetch_one::<AggregateRow>().await }
        })
        .await?;

    let usage_sql = format!(
        "SELECT kv.1 AS usage_key, sum(kv.2) AS total, avg(kv.2) AS mean \
         FROM ({inner}) ARRAY JOIN arrayZip(usage_keys, usage_values) AS kv \
         WHERE 1 = 1{filter_tail} GROUP BY usage_key ORDER BY usage_key"
    );
    let usage = client
        .with_retries("stats.usage", |c| {
            let query = bind_all(c.query(&usage_sql), binds);
            async move { query.fetch_all::<UsageStatRow>().await }
        })
        .await?;

    let feedback_sql = format!(
        "SELECT name, min(v) AS low, avg(v) AS mean, max(v) AS high FROM ( \
             SELECT entity_id, name, created_by, \
                    argMax(value_nanos, last_updated_at) / 1000000000.0 AS v \
             FROM feedback_scores \
             WHERE workspace_id = ? AND entity_type = '{entity_type}' \
               AND entity_id IN (SELECT id FROM ({inner}) WHERE 1 = 1{filter_tail}) \
             GROUP BY entity_id, name, created_by \
         ) GROUP BY name ORDER BY name",
        entity_type = target.entity_type()
    );
    let feedback = client
        .with_retries("stats.feedback", |c| {
            let query = bind_all(
                c.query(&feedback_sql).bind(workspace_id),
                binds,
            );
            async move { query.fetch_all::<FeedbackStatRow>().await }
        })
        .await?;

    Ok(StatsSummary {
        count: aggregate.count,
        duration: DurationStats {
            p50: aggregate.duration_p50.filter(|v| v.is_finite()),
            p90: aggregate.duration_p90.filter(|v| v.is_finite()),
            p99: aggregate.duration_p99.filter(|v| v.is_finite()),
            avg: aggregate.duration_avg.filter(|v| v.is_finite()),
        },
        total_estimated_cost_sum: if aggregate.cost_sum > 0.0 {
            Decimal::from_f64(aggregate.cost_sum).map(floor_to_cost_scale)
        } else {
            None
        },
        usage: usage
            .into_iter()
            .map(|row| UsageStat {
                name: row.name,
                sum: row.sum,
                avg: row.avg,
            })
            .collect(),
        feedback_scores: feedback
            .into_iter()
            .map(|row| FeedbackScoreStat {
                name: row.name,
                min: row.min,
                avg: row.avg,
                max: row.max,
            })
            .collect(),
        cardinality: CardinalityStats {
            name: aggregate.name_cardinality,
            model: match target {
                StatsTarget::Spans => Some(aggregate.model_cardinality),
                StatsTarget::Traces => None,
            },
            provider: match target {
                StatsTarget::Spans => Some(aggregate.provider_cardinality),
                StatsTarget::Traces => None,
            },
        },
    })
}
