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

//! Comment endpoints. Unlike feedback scores, commenting a missing entity
//! is a 404. A shadow row (update before create) still counts as existing.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use uuid::Uuid;

use traceloom_core::comment::{validate_comment_text, Comment, CommentWrite, DeleteComments};
use traceloom_core::types::EntityType;

use crate::api::{parse_entity_id, AppState};
use crate::auth::{ensure_write_allowed, AuthContext};
use crate::error::{ApiError, ApiJson};

async fn entity_project(
    state: &AppState,
    workspace_id: &str,
    entity_type: EntityType,
    entity_id: Uuid,
) -> Result<Option<Uuid>, ApiError> {
    Ok(match entity_type {
        EntityType::Span => state
            .storage
            .spans
            .find_latest(workspace_id, entity_id)
            .await?
            .map(|row| row.project_id),
        EntityType::Trace => state
            .storage
            .traces
            .find_latest(workspace_id, entity_id)
            .await?
            .map(|row| row.project_id),
    })
}

async fn create_comment(
    state: AppState,
    auth: AuthContext,
    entity_type: EntityType,
    raw_id: String,
    write: CommentWrite,
) -> Result<Response, ApiError> {
    ensure_write_allowed(&auth)?;
    let entity_id = parse_entity_id(&raw_id)?;
    validate_comment_text(&write.text)
        .map_err(|message| ApiError::Validation(vec![message]))?;

    let Some(project_id) =
        entity_project(&state, &auth.workspace_id, entity_type, entity_id).await?
    else {
        return Err(ApiError::NotFound(format!(
            "{} '{entity_id}' not found",
            match entity_type {
                EntityType::Span => "Span",
                EntityType::Trace => "Trace",
            }
        )));
    };

    let comment = state
        .storage
        .comments
        .create(
            &auth.workspace_id,
            project_id,
            entity_type,
            entity_id,
            write.text,
            &auth.username,
            &Utc::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(comment)).into_response())
}

/// POST /v1/private/spans/{id}/comments
pub async fn create_span_comment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
    ApiJson(write): ApiJson<CommentWrite>,
) -> Result<Response, ApiError> {
    create_comment(state, auth, EntityType::Span, raw_id, write).await
}

/// POST /v1/private/traces/{id}/comments
pub async fn create_trace_comment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
    ApiJson(write): ApiJson<CommentWrite>,
) -> Result<Response, ApiError> {
    create_comment(state, auth, EntityType::Trace, raw_id, write).await
}

/// GET /v1/private/comments/{id}
pub async fn get_comment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
) -> Result<Json<Comment>, ApiError> {
    let id = parse_entity_id(&raw_id)?;
    let comment = state.storage.comments.get(&auth.workspace_id, id).await?;
    Ok(Json(comment))
}

/// PATCH /v1/private/comments/{id}
pub async fn update_comment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
    ApiJson(write): ApiJson<CommentWrite>,
) -> Result<StatusCode, ApiError> {
    ensure_write_allowed(&auth)?;
    let id = parse_entity_id(&raw_id)?;
    validate_comment_text(&write.text)
        .map_err(|message| ApiError::Validation(vec![message]))?;
    state
        .storage
        .comments
        .update(&auth.workspace_id, id, write.text, &auth.username, &Utc::now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/private/comments/delete
pub async fn delete_comments(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ApiJson(request): ApiJson<DeleteComments>,
) -> Result<StatusCode, ApiError> {
    ensure_write_allowed(&auth)?;
    state
        .storage
        .comments
        .delete_many(&auth.workspace_id, &request.ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
