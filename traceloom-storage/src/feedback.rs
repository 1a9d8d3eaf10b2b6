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

//! Feedback score store.
//!
//! Scores live under the composite key `(entity_id, name, author)`; writing
//! the same key replaces the value. A score may reference an entity that has
//! not materialized yet; it is stored anyway and surfaces once the entity
//! exists.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use traceloom_core::feedback::{FeedbackScore, ScoreSource};
use traceloom_core::time;
use traceloom_core::types::EntityType;

use crate::client::StoreClient;
use crate::error::StoreError;
use crate::rows::{nanos, opt_str, score_from_nanos, score_to_nanos, FeedbackScoreRow};

/// One score write, already resolved to a project.
#[derive(Debug, Clone)]
pub struct ScoreWrite {
    pub project_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub name: String,
    pub category_name: Option<String>,
    pub value: Decimal,
    pub reason: Option<String>,
    pub source: ScoreSource,
}

#[derive(Clone)]
pub struct FeedbackStore {
    client: Arc<StoreClient>,
}

impl FeedbackStore {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self { client }
    }

    pub async fn put(
        &self,
        workspace_id: &str,
        author: &str,
        now: &DateTime<Utc>,
        write: ScoreWrite,
    ) -> Result<(), StoreError> {
        self.put_many(workspace_id, author, now, &[write]).await
    }

    /// Bulk insert; composite-key collisions replace the previous value.
    pub async fn put_many(
        &self,
        workspace_id: &str,
        author: &str,
        now: &DateTime<Utc>,
        writes: &[ScoreWrite],
    ) -> Result<(), StoreError> {
        let stamp = nanos(now);
        let rows: Vec<FeedbackScoreRow> = writes
            .iter()
            .map(|w| FeedbackScoreRow {
                workspace_id: workspace_id.to_string(),
                project_id: w.project_id,
                entity_type: w.entity_type.as_str().to_string(),
                entity_id: w.entity_id,
                name: w.name.clone(),
                category_name: w.category_name.clone().unwrap_or_default(),
                value_nanos: score_to_nanos(w.value),
                reason: w.reason.clone().unwrap_or_default(),
                source: w.source.as_str().to_string(),
                created_at: stamp,
                created_by: author.to_string(),
                last_updated_at: stamp,
                last_updated_by: author.to_string(),
            })
            .collect();

        self.client
            .with_retries("feedback.put", |c| {
                let rows = rows.clone();
                async move {
                    let mut insert = c.insert("feedback_scores")?;
                    for row in &rows {
                        insert.write(row).await?;
                    }
                    insert.end().await
                }
            })
            .await
    }

    /// Idempotent: deleting a score that never existed is still a success.
    pub async fn delete(
        &self,
        workspace_id: &str,
        entity_type: EntityType,
        entity_id: Uuid,
        name: &str,
        author: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut sql = String::from(
            "DELETE FROM feedback_scores \
             WHERE workspace_id = ? AND entity_type = ? AND entity_id = toUUID(?) AND name = ?",
        );
        if author.is_some() {
            sql.push_str(" AND created_by = ?");
        }
        self.client
            .with_retries("feedback.delete", |c| {
                let entity_id = entity_id.to_string();
                let mut query = c
                    .query(&sql)
                    .bind(workspace_id)
                    .bind(entity_type.as_str())
                    .bind(entity_id.as_str())
                    .bind(name);
                if let Some(author) = author {
                    query = query.bind(author);
                }
                async move { query.execute().await }
            })
            .await
    }

    /// Latest version of every score attached to the given entities.
    pub async fn for_entities(
        &self,
        workspace_id: &str,
        entity_type: EntityType,
        entity_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<FeedbackScore>>, StoreError> {
        if entity_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<String> = entity_ids.iter().map(Uuid::to_string).collect();
        let sql = "SELECT ?fields FROM feedback_scores \
                   WHERE workspace_id = ? AND entity_type = ? AND toString(entity_id) IN ? \
                   ORDER BY last_updated_at DESC LIMIT 1 BY entity_id, name, created_by";
        let rows = self
            .client
            .with_retries("feedback.for_entities", |c| {
                let ids = ids.clone();
                async move {
                    c.query(sql)
                        .bind(workspace_id)
                        .bind(entity_type.as_str())
                        .bind(ids)
                        .fetch_all::<FeedbackScoreRow>()
                        .await
                }
            })
            .await?;

        let mut grouped: HashMap<Uuid, Vec<FeedbackScore>> = HashMap::new();
        for row in rows {
            grouped
                .entry(row.entity_id)
                .or_default()
                .push(FeedbackScore {
                    name: row.name,
                    category_name: opt_str(&row.category_name),
                    value: score_from_nanos(row.value_nanos),
                    reason: opt_str(&row.reason),
                    source: ScoreSource::from_str(&row.source).unwrap_or(ScoreSource::Sdk),
                    created_at: Some(time::from_nanos(row.created_at)),
                    last_updated_at: Some(time::from_nanos(row.last_updated_at)),
                    created_by: opt_str(&row.created_by),
                    last_updated_by: opt_str(&row.last_updated_by),
                });
        }
        Ok(grouped)
    }

    /// Distinct score names in a project scope, for filter autocompletion.
    pub async fn names(
        &self,
        workspace_id: &str,
        entity_type: EntityType,
        project_id: Uuid,
    ) -> Result<Vec<String>, StoreError> {
        #[derive(clickhouse::Row, serde::Deserialize)]
        struct NameRow {
            name: String,
        }

        let sql = "SELECT DISTINCT name FROM feedback_scores \
                   WHERE workspace_id = ? AND entity_type = ? AND project_id = toUUID(?) \
                   ORDER BY name";
        let rows = self
            .client
            .with_retries("feedback.names", |c| {
                let project_id = project_id.to_string();
                async move {
                    c.query(sql)
                        .bind(workspace_id)
                        .bind(entity_type.as_str())
                        .bind(project_id.as_str())
                        .fetch_all::<NameRow>()
                        .await
                }
            })
            .await?;
        Ok(rows.into_iter().map(|row| row.name).collect())
    }
}
