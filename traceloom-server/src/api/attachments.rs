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

//! Attachment listing and download.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use traceloom_core::types::EntityType;

use crate::api::{resolve_project_scope, AppState};
use crate::attachments::object_key;
use crate::auth::AuthContext;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct AttachmentListQuery {
    pub project_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct AttachmentView {
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub source: String,
}

/// GET /v1/private/attachments
pub async fn list_attachments(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<AttachmentListQuery>,
) -> Result<Json<Vec<AttachmentView>>, ApiError> {
    let project =
        resolve_project_scope(&state, &auth, None, Some(query.project_id)).await?;
    let rows = state
        .storage
        .attachments
        .list(
            &auth.workspace_id,
            project.id,
            query.entity_type,
            query.entity_id,
        )
        .await?;
    Ok(Json(
        rows.into_iter()
            .map(|row| AttachmentView {
                file_name: row.file_name,
                mime_type: row.mime_type,
                file_size: row.file_size,
                source: row.source,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct AttachmentDownloadQuery {
    pub project_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub file_name: String,
}

/// GET /v1/private/attachments/download
pub async fn download_attachment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<AttachmentDownloadQuery>,
) -> Result<Response, ApiError> {
    let project =
        resolve_project_scope(&state, &auth, None, Some(query.project_id)).await?;
    let rows = state
        .storage
        .attachments
        .list(
            &auth.workspace_id,
            project.id,
            query.entity_type,
            query.entity_id,
        )
        .await?;
    let row = rows
        .into_iter()
        .find(|row| row.file_name == query.file_name)
        .ok_or_else(|| {
            ApiError::NotFound(format!("Attachment '{}' not found", query.file_name))
        })?;

    let key = object_key(
        &auth.workspace_id,
        project.id,
        query.entity_type,
        query.entity_id,
        &row.file_name,
    );
    let bytes = state
        .object_store
        .get(&key)
        .await
        .map_err(|e| ApiError::Internal(format!("attachment fetch failed: {e}")))?
        .ok_or_else(|| {
            ApiError::NotFound(format!("Attachment '{}' not found", query.file_name))
        })?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, row.mime_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", row.file_name),
            ),
        ],
        bytes,
    )
        .into_response())
}
