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

//! Attachment metadata index. The bytes themselves live in the object
//! store; this table answers "what attachments does this entity have".

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use traceloom_core::attachment::AttachmentSource;
use traceloom_core::types::EntityType;

use crate::client::StoreClient;
use crate::error::StoreError;
use crate::rows::{nanos, AttachmentRow};

#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub project_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub source: AttachmentSource,
}

#[derive(Clone)]
pub struct AttachmentIndex {
    client: Arc<StoreClient>,
}

impl AttachmentIndex {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self { client }
    }

    pub async fn record_many(
        &self,
        workspace_id: &str,
        now: &DateTime<Utc>,
        records: &[AttachmentRecord],
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let stamp = nanos(now);
        let rows: Vec<AttachmentRow> = records
            .iter()
            .map(|r| AttachmentRow {
                workspace_id: workspace_id.to_string(),
                project_id: r.project_id,
                entity_type: r.entity_type.as_str().to_string(),
                entity_id: r.entity_id,
                file_name: r.file_name.clone(),
                mime_type: r.mime_type.clone(),
                file_size: r.file_size,
                source: r.source.as_str().to_string(),
                created_at: stamp,
            })
            .collect();
        self.client
            .with_retries("attachments.record", |c| {
                let rows = rows.clone();
                async move {
                    let mut insert = c.insert("attachments")?;
                    for row in &rows {
                        insert.write(row).await?;
                    }
                    insert.end().await
                }
            })
            .await
    }

    pub async fn list(
        &self,
        workspace_id: &str,
        project_id: Uuid,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> Result<Vec<AttachmentRow>, StoreError> {
        let sql = "SELECT ?fields FROM attachments \
                   WHERE workspace_id = ? AND project_id = toUUID(?) \
                     AND entity_type = ? AND entity_id = toUUID(?) \
                   ORDER BY created_at DESC LIMIT 1 BY file_name";
        self.client
            .with_retries("attachments.list", |c| {
                let project_id = project_id.to_string();
                let entity_id = entity_id.to_string();
                async move {
                    c.query(sql)
                        .bind(workspace_id)
                        .bind(project_id.as_str())
                        .bind(entity_type.as_str())
                        .bind(entity_id.as_str())
                        .fetch_all::<AttachmentRow>()
                        .await
                }
            })
            .await
    }

    /// Writing an entity replaces its auto-stripped attachments; rows for
    /// user uploads stay.
    pub async fn delete_auto_stripped(
        &self,
        workspace_id: &str,
        project_id: Uuid,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> Result<(), StoreError> {
        let sql = "DELETE FROM attachments \
                   WHERE workspace_id = ? AND project_id = toUUID(?) \
                     AND entity_type = ? AND entity_id = toUUID(?) AND source = ?";
        self.client
            .with_retries("attachments.delete_auto", |c| {
                let project_id = project_id.to_string();
                let entity_id = entity_id.to_string();
                async move {
                    c.query(sql)
                        .bind(workspace_id)
                        .bind(project_id.as_str())
                        .bind(entity_type.as_str())
                        .bind(entity_id.as_str())
                        .bind(AttachmentSource::AutoStripped.as_str())
                        .execute()
                        .await
                }
            })
            .await
    }
}
