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

//! Span store: versioned upsert plus paged, streamed, and aggregate reads.

use std::sync::Arc;

use clickhouse::query::Query;
use tracing::debug;
use uuid::Uuid;

use traceloom_core::cost::PricingTable;
use traceloom_core::filter::{FilterClause, FilterEntity, SortClause};
use traceloom_core::types::{Page, Span, SpanType, SpanUpdate, SpanWrite};

use crate::client::StoreClient;
use crate::error::StoreError;
use crate::merge::{self, WriteContext, WriteOutcome};
use crate::rows::SpanRow;
use crate::sql::{self, BindValue};
use crate::stats::{self, StatsSummary};

/// Inner query collapsing the version history to the latest row per id.
fn latest_versions_sql(trace_scoped: bool, type_scoped: bool) -> String {
    let mut sql = String::from(
        "SELECT * FROM spans WHERE workspace_id = ? AND project_id = toUUID(?)",
    );
    if trace_scoped {
        sql.push_str(" AND trace_id = toUUID(?)");
    }
    if type_scoped {
        sql.push_str(" AND span_type = ?");
    }
    sql.push_str(" ORDER BY last_updated_at DESC LIMIT 1 BY id");
    sql
}

pub(crate) fn bind_all(mut query: Query, binds: &[BindValue]) -> Query {
    for bind in binds {
        query = match bind {
            BindValue::Str(s) => query.bind(s.as_str()),
            BindValue::F64(f) => query.bind(*f),
            BindValue::I64(i) => query.bind(*i),
        };
    }
    query
}

#[derive(Debug, Clone, Default)]
pub struct SpanListCriteria {
    pub trace_id: Option<Uuid>,
    pub span_type: Option<SpanType>,
    pub filters: Vec<FilterClause>,
    pub sorting: Vec<SortClause>,
    /// 1-based.
    pub page: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SpanStreamCriteria {
    pub trace_id: Option<Uuid>,
    pub span_type: Option<SpanType>,
    pub filters: Vec<FilterClause>,
    pub limit: usize,
    pub last_retrieved_id: Option<Uuid>,
}

/// Per-item outcome report for a batch write.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub written: usize,
    pub dropped_stale: usize,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct SpanStore {
    client: Arc<StoreClient>,
    pricing: Arc<PricingTable>,
}

impl SpanStore {
    pub fn new(client: Arc<StoreClient>, pricing: Arc<PricingTable>) -> Self {
        Self { client, pricing }
    }

    /// Latest stored version of a span, shadow rows included.
    pub async fn find_latest(
        &self,
        workspace_id: &str,
        id: Uuid,
    ) -> Result<Option<SpanRow>, StoreError> {
        let sql = "SELECT ?fields FROM spans \
                   WHERE workspace_id = ? AND id = toUUID(?) \
                   ORDER BY last_updated_at DESC LIMIT 1";
        self.client
            .with_retries("spans.find_latest", |c| {
                let id = id.to_string();
                async move {
                    c.query(sql)
                        .bind(workspace_id)
                        .bind(id.as_str())
                        .fetch_optional::<SpanRow>()
                        .await
                }
            })
            .await
    }

    async fn insert_rows(&self, rows: &[SpanRow]) -> Result<(), StoreError> {
        self.client
            .with_retries("spans.insert", |c| async move {
                let mut insert = c.insert("spans")?;
                for row in rows {
                    insert.write(row).await?;
                }
                insert.end().await
            })
            .await
    }

    /// Insert-or-merge; the row written is the merge of the stored latest
    /// version with this write.
    pub async fn create(
        &self,
        ctx: &WriteContext,
        id: Uuid,
        write: &SpanWrite,
    ) -> Result<Uuid, StoreError> {
        let existing = self.find_latest(&ctx.workspace_id, id).await?;
        match merge::create_span(existing.as_ref(), ctx, id, write, &self.pricing)? {
            WriteOutcome::Write(row) => {
                self.insert_rows(std::slice::from_ref(&row)).await?;
                debug!(span_id = %id, merged = existing.is_some(), "span created");
            }
            WriteOutcome::Stale => {
                debug!(span_id = %id, "stale span create dropped");
            }
        }
        Ok(id)
    }

    /// Partial update; records a shadow row when the span does not exist yet.
    pub async fn update(
        &self,
        ctx: &WriteContext,
        id: Uuid,
        update: &SpanUpdate,
    ) -> Result<(), StoreError> {
        let existing = self.find_latest(&ctx.workspace_id, id).await?;
        match merge::update_span(existing.as_ref(), ctx, id, update, &self.pricing)? {
            WriteOutcome::Write(row) => {
                self.insert_rows(std::slice::from_ref(&row)).await?;
                debug!(span_id = %id, shadow = existing.is_none(), "span updated");
            }
            WriteOutcome::Stale => {
                debug!(span_id = %id, "stale span update dropped");
            }
        }
        Ok(())
    }

    pub async fn get(&self, workspace_id: &str, id: Uuid) -> Result<Span, StoreError> {
        let row = self
            .find_latest(workspace_id, id)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(row.into_span())
    }

    /// Batch insert with per-item error isolation: conflicts are reported,
    /// the rest of the batch still lands in one bulk write.
    pub async fn create_batch(
        &self,
        items: Vec<(WriteContext, Uuid, SpanWrite)>,
    ) -> Result<BatchOutcome, StoreError> {
        let Some((first_ctx, _, _)) = items.first() else {
            return Ok(BatchOutcome::default());
        };
        let workspace_id = first_ctx.workspace_id.clone();
        let ids: Vec<String> = items.iter().map(|(_, id, _)| id.to_string()).collect();

        let sql = "SELECT ?fields FROM spans \
                   WHERE workspace_id = ? AND toString(id) IN ? \
                   ORDER BY last_updated_at DESC LIMIT 1 BY id";
        let existing = self
            .client
            .with_retries("spans.find_batch", |c| {
                let ids = ids.clone();
                let workspace_id = workspace_id.clone();
                async move {
                    c.query(sql)
                        .bind(workspace_id.as_str())
                        .bind(ids)
                        .fetch_all::<SpanRow>()
                        .await
                }
            })
            .await?;
        let by_id: std::collections::HashMap<Uuid, &SpanRow> =
            existing.iter().map(|row| (row.id, row)).collect();

        let mut outcome = BatchOutcome::default();
        let mut rows = Vec::with_capacity(items.len());
        for (index, (ctx, id, write)) in items.iter().enumerate() {
            match merge::create_span(by_id.get(id).copied(), ctx, *id, write, &self.pricing) {
                Ok(WriteOutcome::Write(row)) => rows.push(row),
                Ok(WriteOutcome::Stale) => outcome.dropped_stale += 1,
                Err(StoreError::Conflict(message)) => {
                    outcome.errors.push(format!("span {index}: {message}"));
                }
                Err(other) => return Err(other),
            }
        }

        if !rows.is_empty() {
            self.insert_rows(&rows).await?;
        }
        outcome.written = rows.len();
        Ok(outcome)
    }

    pub async fn list(
        &self,
        workspace_id: &str,
        project_id: Uuid,
        criteria: &SpanListCriteria,
    ) -> Result<Page<Span>, StoreError> {
        let filter = sql::render_filters(FilterEntity::Span, &criteria.filters, workspace_id)
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        let inner = latest_versions_sql(criteria.trace_id.is_some(), criteria.span_type.is_some());
        let mut scope_binds = vec![
            BindValue::Str(workspace_id.to_string()),
            BindValue::Str(project_id.to_string()),
        ];
        if let Some(trace_id) = criteria.trace_id {
            scope_binds.push(BindValue::Str(trace_id.to_string()));
        }
        if let Some(span_type) = criteria.span_type {
            scope_binds.push(BindValue::Str(span_type.as_str().to_string()));
        }

        let order_by = if criteria.sorting.is_empty() {
            "ORDER BY trace_id DESC, parent_span_id DESC, id DESC".to_string()
        } else {
            sql::render_sorting(&criteria.sorting)
        };

        let count_sql = format!(
            "SELECT count() FROM ({inner}) WHERE 1 = 1{}",
            filter.and_clause()
        );
        let total = self
            .client
            .with_retries("spans.count", |c| {
                let query = bind_all(bind_all(c.query(&count_sql), &scope_binds), &filter.binds);
                async move { query.fetch_one::<u64>().await }
            })
            .await?;

        let page = criteria.page.max(1);
        let rows_sql = format!(
            "SELECT ?fields FROM ({inner}) WHERE 1 = 1{} {order_by} LIMIT ? OFFSET ?",
            filter.and_clause()
        );
        let offset = (page - 1) * criteria.size;
        let rows = self
            .client
            .with_retries("spans.list", |c| {
                let query = bind_all(bind_all(c.query(&rows_sql), &scope_binds), &filter.binds)
                    .bind(criteria.size as u64)
                    .bind(offset as u64);
                async move { query.fetch_all::<SpanRow>().await }
            })
            .await?;

        Ok(Page {
            page,
            size: rows.len(),
            total,
            content: rows.into_iter().map(SpanRow::into_span).collect(),
        })
    }

    /// One chunk of a stream: `id DESC` strictly below the cursor, so ids are
    /// never repeated and never skipped.
    pub async fn stream_chunk(
        &self,
        workspace_id: &str,
        project_id: Uuid,
        criteria: &SpanStreamCriteria,
    ) -> Result<Vec<Span>, StoreError> {
        let filter = sql::render_filters(FilterEntity::Span, &criteria.filters, workspace_id)
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        let inner = latest_versions_sql(criteria.trace_id.is_some(), criteria.span_type.is_some());
        let mut binds = vec![
            BindValue::Str(workspace_id.to_string()),
            BindValue::Str(project_id.to_string()),
        ];
        if let Some(trace_id) = criteria.trace_id {
            binds.push(BindValue::Str(trace_id.to_string()));
        }
        if let Some(span_type) = criteria.span_type {
            binds.push(BindValue::Str(span_type.as_str().to_string()));
        }
        binds.extend(filter.binds.iter().cloned());

        let mut where_tail = filter.and_clause();
        if let Some(cursor) = criteria.last_retrieved_id {
            where_tail.push_str(" AND id < toUUID(?)");
            binds.push(BindValue::Str(cursor.to_string()));
        }

        let sql = format!(
            "SELECT ?fields FROM ({inner}) WHERE 1 = 1{where_tail} ORDER BY id DESC LIMIT ?"
        );
        let rows = self
            .client
            .with_retries("spans.stream_chunk", |c| {
                let query = bind_all(c.query(&sql), &binds).bind(criteria.limit as u64);
                async move { query.fetch_all::<SpanRow>().await }
            })
            .await?;
        Ok(rows.into_iter().map(SpanRow::into_span).collect())
    }

    pub async fn stats(
        &self,
        workspace_id: &str,
        project_id: Uuid,
        trace_id: Option<Uuid>,
        span_type: Option<SpanType>,
        filters: &[FilterClause],
    ) -> Result<StatsSummary, StoreError> {
        let filter = sql::render_filters(FilterEntity::Span, filters, workspace_id)
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        let inner = latest_versions_sql(trace_id.is_some(), span_type.is_some());
        let mut binds = vec![
            BindValue::Str(workspace_id.to_string()),
            BindValue::Str(project_id.to_string()),
        ];
        if let Some(trace_id) = trace_id {
            binds.push(BindValue::Str(trace_id.to_string()));
        }
        if let Some(span_type) = span_type {
            binds.push(BindValue::Str(span_type.as_str().to_string()));
        }
        binds.extend(filter.binds.iter().cloned());

        stats::collect(
            &self.client,
            stats::StatsTarget::Spans,
            workspace_id,
            &inner,
            &filter.and_clause(),
            &binds,
        )
        .await
    }
}
