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

//! Trace store; same versioned-upsert shape as the span store.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use traceloom_core::cost::PricingTable;
use traceloom_core::filter::{FilterClause, FilterEntity, SortClause};
use traceloom_core::types::{Page, Trace, TraceUpdate, TraceWrite};

use crate::client::StoreClient;
use crate::error::StoreError;
use crate::merge::{self, WriteContext, WriteOutcome};
use crate::rows::TraceRow;
use crate::spans::{bind_all, BatchOutcome};
use crate::sql::{self, BindValue};
use crate::stats::{self, StatsSummary};

fn latest_versions_sql(thread_scoped: bool) -> String {
    let mut sql = String::from(
        "SELECT * FROM traces WHERE workspace_id = ? AND project_id = toUUID(?)",
    );
    if thread_scoped {
        sql.push_str(" AND thread_id = ?");
    }
    sql.push_str(" ORDER BY last_updated_at DESC LIMIT 1 BY id");
    sql
}

#[derive(Debug, Clone, Default)]
pub struct TraceListCriteria {
    pub thread_id: Option<String>,
    pub filters: Vec<FilterClause>,
    pub sorting: Vec<SortClause>,
    /// 1-based.
    pub page: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TraceStreamCriteria {
    pub filters: Vec<FilterClause>,
    pub limit: usize,
    pub last_retrieved_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct TraceStore {
    client: Arc<StoreClient>,
    pricing: Arc<PricingTable>,
}

impl TraceStore {
    pub fn new(client: Arc<StoreClient>, pricing: Arc<PricingTable>) -> Self {
        Self { client, pricing }
    }

    pub async fn find_latest(
        &self,
        workspace_id: &str,
        id: Uuid,
    ) -> Result<Option<TraceRow>, StoreError> {
        let sql = "SELECT ?fields FROM traces \
                   WHERE workspace_id = ? AND id = toUUID(?) \
                   ORDER BY last_updated_at DESC LIMIT 1";
        self.client
            .with_retries("traces.find_latest", |c| {
                let id = id.to_string();
                async move {
                    c.query(sql)
                        .bind(workspace_id)
                        .bind(id.as_str())
                        .fetch_optional::<TraceRow>()
                        .await
                }
            })
            .await
    }

    async fn insert_rows(&self, rows: &[TraceRow]) -> Result<(), StoreError> {
        self.client
            .with_retries("traces.insert", |c| async move {
                let mut insert = c.insert("traces")?;
                for row in rows {
                    insert.write(row).await?;
                }
                insert.end().await
            })
            .await
    }

    pub async fn create(
        &self,
        ctx: &WriteContext,
        id: Uuid,
        write: &TraceWrite,
    ) -> Result<Uuid, StoreError> {
        let existing = self.find_latest(&ctx.workspace_id, id).await?;
        match merge::create_trace(existing.as_ref(), ctx, id, write, &self.pricing)? {
            WriteOutcome::Write(row) => {
                self.insert_rows(std::slice::from_ref(&row)).await?;
                debug!(trace_id = %id, merged = existing.is_some(), "trace created");
            }
            WriteOutcome::Stale => {
                debug!(trace_id = %id, "stale trace create dropped");
            }
        }
        Ok(id)
    }

    pub async fn update(
        &self,
        ctx: &WriteContext,
        id: Uuid,
        update: &TraceUpdate,
    ) -> Result<(), StoreError> {
        let existing = self.find_latest(&ctx.workspace_id, id).await?;
        match merge::update_trace(existing.as_ref(), ctx, id, update, &self.pricing)? {
            WriteOutcome::Write(row) => {
                self.insert_rows(std::slice::from_ref(&row)).await?;
                debug!(trace_id = %id, shadow = existing.is_none(), "trace updated");
            }
            WriteOutcome::Stale => {
                debug!(trace_id = %id, "stale trace update dropped");
            }
        }
        Ok(())
    }

    pub async fn get(&self, workspace_id: &str, id: Uuid) -> Result<Trace, StoreError> {
        let row = self
            .find_latest(workspace_id, id)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(row.into_trace())
    }

    pub async fn create_batch(
        &self,
        items: Vec<(WriteContext, Uuid, TraceWrite)>,
    ) -> Result<BatchOutcome, StoreError> {
        let Some((first_ctx, _, _)) = items.first() else {
            return Ok(BatchOutcome::default());
        };
        let workspace_id = first_ctx.workspace_id.clone();
        let ids: Vec<String> = items.iter().map(|(_, id, _)| id.to_string()).collect();

        let sql = "SELECT ?fields FROM traces \
                   WHERE workspace_id = ? AND toString(id) IN ? \
                   ORDER BY last_updated_at DESC LIMIT 1 BY id";
        let existing = self
            .client
            .with_retries("traces.find_batch", |c| {
                let ids = ids.clone();
                let workspace_id = workspace_id.clone();
                async move {
                    c.query(sql)
                        .bind(workspace_id.as_str())
                        .bind(ids)
                        .fetch_all::<TraceRow>()
                        .await
                }
            })
            .await?;
        let by_id: std::collections::HashMap<Uuid, &TraceRow> =
            existing.iter().map(|row| (row.id, row)).collect();

        let mut outcome = BatchOutcome::default();
        let mut rows = Vec::with_capacity(items.len());
        for (index, (ctx, id, write)) in items.iter().enumerate() {
            match merge::create_trace(by_id.get(id).copied(), ctx, *id, write, &self.pricing) {
                Ok(WriteOutcome::Write(row)) => rows.push(row),
                Ok(WriteOutcome::Stale) => outcome.dropped_stale += 1,
                Err(StoreError::Conflict(message)) => {
                    outcome.errors.push(format!("trace {index}: {message}"));
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
        criteria: &TraceListCriteria,
    ) -> Result<Page<Trace>, StoreError> {
        let filter = sql::render_filters(FilterEntity::Trace, &criteria.filters, workspace_id)
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        let inner = latest_versions_sql(criteria.thread_id.is_some());
        let mut scope_binds = vec![
            BindValue::Str(workspace_id.to_string()),
            BindValue::Str(project_id.to_string()),
        ];
        if let Some(thread_id) = &criteria.thread_id {
            scope_binds.push(BindValue::Str(thread_id.clone()));
        }

        let order_by = if criteria.sorting.is_empty() {
            "ORDER BY id DESC".to_string()
        } else {
            sql::render_sorting(&criteria.sorting)
        };

        let count_sql = format!(
            "SELECT count() FROM ({inner}) WHERE 1 = 1{}",
            filter.and_clause()
        );
        let total = self
            .client
            .with_retries("traces.count", |c| {
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
            .with_retries("traces.list", |c| {
                let query = bind_all(bind_all(c.query(&rows_sql), &scope_binds), &filter.binds)
                    .bind(criteria.size as u64)
                    .bind(offset as u64);
                async move { query.fetch_all::<TraceRow>().await }
            })
            .await?;

        Ok(Page {
            page,
            size: rows.len(),
            total,
            content: rows.into_iter().map(TraceRow::into_trace).collect(),
        })
    }

    pub async fn stream_chunk(
        &self,
        workspace_id: &str,
        project_id: Uuid,
        criteria: &TraceStreamCriteria,
    ) -> Result<Vec<Trace>, StoreError> {
        let filter = sql::render_filters(FilterEntity::Trace, &criteria.filters, workspace_id)
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        let inner = latest_versions_sql(false);
        let mut binds = vec![
            BindValue::Str(workspace_id.to_string()),
            BindValue::Str(project_id.to_string()),
        ];
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
            .with_retries("traces.stream_chunk", |c| {
                let query = bind_all(c.query(&sql), &binds).bind(criteria.limit as u64);
                async move { query.fetch_all::<TraceRow>().await }
            })
            .await?;
        Ok(rows.into_iter().map(TraceRow::into_trace).collect())
    }

    pub async fn stats(
        &self,
        workspace_id: &str,
        project_id: Uuid,
        filters: &[FilterClause],
    ) -> Result<StatsSummary, StoreError> {
        let filter = sql::render_filters(FilterEntity::Trace, filters, workspace_id)
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        let inner = latest_versions_sql(false);
        let mut binds = vec![
            BindValue::Str(workspace_id.to_string()),
            BindValue::Str(project_id.to_string()),
        ];
        binds.extend(filter.binds.iter().cloned());

        stats::collect(
            &self.client,
            stats::StatsTarget::Traces,
            workspace_id,
            &inner,
            &filter.and_clause(),
            &binds,
        )
        .await
    }
}
