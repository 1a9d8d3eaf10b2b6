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

//! Comment store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use traceloom_core::comment::Comment;
use traceloom_core::ids;
use traceloom_core::time;
use traceloom_core::types::EntityType;

use crate::client::StoreClient;
use crate::error::StoreError;
use crate::rows::{nanos, opt_str, CommentRow};

#[derive(Clone)]
pub struct CommentStore {
    client: Arc<StoreClient>,
}

impl CommentStore {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self { client }
    }

    async fn insert_row(&self, row: CommentRow) -> Result<(), StoreError> {
        self.client
            .with_retries("comments.insert", |c| {
                let row = row.clone();
                async move {
                    let mut insert = c.insert("comments")?;
                    insert.write(&row).await?;
                    insert.end().await
                }
            })
            .await
    }

    pub async fn create(
        &self,
        workspace_id: &str,
        project_id: Uuid,
        entity_type: EntityType,
        entity_id: Uuid,
        text: String,
        author: &str,
        now: &DateTime<Utc>,
    ) -> Result<Comment, StoreError> {
        let id = ids::new_v7();
        let stamp = nanos(now);
        let row = CommentRow {
            workspace_id: workspace_id.to_string(),
            project_id,
            entity_type: entity_type.as_str().to_string(),
            entity_id,
            id,
            text,
            created_at: stamp,
            created_by: author.to_string(),
            last_updated_at: stamp,
            last_updated_by: author.to_string(),
        };
        self.insert_row(row.clone()).await?;
        Ok(row_to_comment(row))
    }

    async fn find(&self, workspace_id: &str, id: Uuid) -> Result<Option<CommentRow>, StoreError> {
        let sql = "SELECT ?fields FROM comments \
                   WHERE workspace_id = ? AND id = toUUID(?) \
                   ORDER BY last_updated_at DESC LIMIT 1";
        self.client
            .with_retries("comments.find", |c| {
                let id = id.to_string();
                async move {
                    c.query(sql)
                        .bind(workspace_id)
                        .bind(id.as_str())
                        .fetch_optional::<CommentRow>()
                        .await
                }
            })
            .await
    }

    pub async fn get(&self, workspace_id: &str, id: Uuid) -> Result<Comment, StoreError> {
        let row = self
            .find(workspace_id, id)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(row_to_comment(row))
    }

    pub async fn update(
        &self,
        workspace_id: &str,
        id: Uuid,
        text: String,
        author: &str,
        now: &DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut row = self
            .find(workspace_id, id)
            .await?
            .ok_or(StoreError::NotFound)?;
        row.text = text;
        row.last_updated_at = nanos(now);
        row.last_updated_by = author.to_string();
        self.insert_row(row).await
    }

    /// Idempotent bulk delete.
    pub async fn delete_many(&self, workspace_id: &str, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let id_strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let sql = "DELETE FROM comments WHERE workspace_id = ? AND toString(id) IN ?";
        self.client
            .with_retries("comments.delete", |c| {
                let id_strings = id_strings.clone();
                async move {
                    c.query(sql)
                        .bind(workspace_id)
                        .bind(id_strings)
                        .execute()
                        .await
                }
            })
            .await
    }

    pub async fn for_entities(
        &self,
        workspace_id: &str,
        entity_type: EntityType,
        entity_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<Comment>>, StoreError> {
        if entity_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<String> = entity_ids.iter().map(Uuid::to_string).collect();
        let sql = "SELECT ?fields FROM comments \
                   WHERE workspace_id = ? AND entity_type = ? AND toString(entity_id) IN ? \
                   ORDER BY last_updated_at DESC LIMIT 1 BY id";
        let rows = self
            .client
            .with_retries("comments.for_entities", |c| {
                let ids = ids.clone();
                async move {
                    c.query(sql)
                        .bind(workspace_id)
                        .bind(entity_type.as_str())
                        .bind(ids)
                        .fetch_all::<CommentRow>()
                        .await
                }
            })
            .await?;

        let mut grouped: HashMap<Uuid, Vec<Comment>> = HashMap::new();
        for row in rows {
            let entity_id = row.entity_id;
            grouped.entry(entity_id).or_default().push(row_to_comment(row));
        }
        Ok(grouped)
    }
}

fn row_to_comment(row: CommentRow) -> Comment {
    Comment {
        id: row.id,
        text: row.text,
        created_at: Some(time::from_nanos(row.created_at)),
        last_updated_at: Some(time::from_nanos(row.last_updated_at)),
        created_by: opt_str(&row.created_by),
        last_updated_by: opt_str(&row.last_updated_by),
    }
}
