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

//! Feedback score endpoints for traces and spans.
//!
//! A score may arrive before its entity; it is stored against the id and
//! becomes visible when the entity materializes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use traceloom_core::feedback::{
    validate_score_name, validate_score_value, DeleteFeedbackScore, FeedbackScore,
    FeedbackScoreBatch,
};
use traceloom_core::ids;
use traceloom_core::types::EntityType;
use traceloom_core::validation::{check_batch_cap, FieldErrors};
use traceloom_storage::feedback::ScoreWrite;

use crate::api::{parse_entity_id, resolve_or_create_project, AppState};
use crate::auth::{ensure_write_allowed, AuthContext};
use crate::error::{ApiError, ApiJson};

/// Project scope of an entity's scores: the entity's own project when it
/// already has rows, else the default project until it materializes.
async fn score_project_id(
    state: &AppState,
    auth: &AuthContext,
    entity_type: EntityType,
    entity_id: Uuid,
    project_name: Option<&str>,
) -> Result<Uuid, ApiError> {
    if let Some(name) = project_name {
        return Ok(resolve_or_create_project(state, auth, Some(name)).await?.id);
    }
    let existing = match entity_type {
        EntityType::Span => state
            .storage
            .spans
            .find_latest(&auth.workspace_id, entity_id)
            .await?
            .map(|row| row.project_id),
        EntityType::Trace => state
            .storage
            .traces
            .find_latest(&auth.workspace_id, entity_id)
            .await?
            .map(|row| row.project_id),
    };
    match existing {
        Some(project_id) => Ok(project_id),
        None => Ok(resolve_or_create_project(state, auth, None).await?.id),
    }
}

async fn put_score(
    state: AppState,
    auth: AuthContext,
    entity_type: EntityType,
    raw_id: String,
    score: FeedbackScore,
) -> Result<StatusCode, ApiError> {
    ensure_write_allowed(&auth)?;
    let entity_id = parse_entity_id(&raw_id)?;

    let mut errors = FieldErrors::new();
    errors.check(validate_score_name(&score.name));
    errors.check(validate_score_value(&score.value));
    errors.into_result().map_err(ApiError::Validation)?;

    let project_id = score_project_id(&state, &auth, entity_type, entity_id, None).await?;
    state
        .storage
        .feedback
        .put(
            &auth.workspace_id,
            &auth.username,
            &Utc::now(),
            ScoreWrite {
                project_id,
                entity_type,
                entity_id,
                name: score.name,
                category_name: score.category_name,
                value: score.value,
                reason: score.reason,
                source: score.source,
            },
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_score(
    state: AppState,
    auth: AuthContext,
    entity_type: EntityType,
    raw_id: String,
    request: DeleteFeedbackScore,
) -> Result<StatusCode, ApiError> {
    ensure_write_allowed(&auth)?;
    let entity_id = parse_entity_id(&raw_id)?;
    state
        .storage
        .feedback
        .delete(
            &auth.workspace_id,
            entity_type,
            entity_id,
            &request.name,
            request.author.as_deref(),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn batch_scores(
    state: AppState,
    auth: AuthContext,
    entity_type: EntityType,
    batch: FeedbackScoreBatch,
) -> Result<StatusCode, ApiError> {
    ensure_write_allowed(&auth)?;
    check_batch_cap(batch.scores.len(), "scores").map_err(ApiError::Unprocessable)?;

    // One malformed id fails the whole batch before anything lands.
    for item in &batch.scores {
        ids::require_v7(&item.id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }
    let mut errors = FieldErrors::new();
    for item in &batch.scores {
        errors.check(validate_score_name(&item.name));
        errors.check(validate_score_value(&item.value));
    }
    errors.into_result().map_err(ApiError::Validation)?;

    let mut writes = Vec::with_capacity(batch.scores.len());
    for item in batch.scores {
        let project_id = score_project_id(
            &state,
            &auth,
            entity_type,
            item.id,
            item.project_name.as_deref(),
        )
        .await?;
        writes.push(ScoreWrite {
            project_id,
            entity_type,
            entity_id: item.id,
            name: item.name,
            category_name: item.category_name,
            value: item.value,
            reason: item.reason,
            source: item.source,
        });
    }
    state
        .storage
        .feedback
        .put_many(&auth.workspace_id, &auth.username, &Utc::now(), &writes)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// Span-flavored routes

/// PUT /v1/private/spans/{id}/feedback-scores
#[instrument(skip_all, fields(span_id = %raw_id))]
pub async fn put_span_score(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
    ApiJson(score): ApiJson<FeedbackScore>,
) -> Result<StatusCode, ApiError> {
    put_score(state, auth, EntityType::Span, raw_id, score).await
}

/// POST /v1/private/spans/{id}/feedback-scores/delete
pub async fn delete_span_score(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
    ApiJson(request): ApiJson<DeleteFeedbackScore>,
) -> Result<StatusCode, ApiError> {
    delete_score(state, auth, EntityType::Span, raw_id, request).await
}

/// PUT /v1/private/spans/feedback-scores
pub async fn batch_span_scores(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ApiJson(batch): ApiJson<FeedbackScoreBatch>,
) -> Result<StatusCode, ApiError> {
    batch_scores(state, auth, EntityType::Span, batch).await
}

// Trace-flavored routes

/// PUT /v1/private/traces/{id}/feedback-scores
#[instrument(skip_all, fields(trace_id = %raw_id))]
pub async fn put_trace_score(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
    ApiJson(score): ApiJson<FeedbackScore>,
) -> Result<StatusCode, ApiError> {
    put_score(state, auth, EntityType::Trace, raw_id, score).await
}

/// POST /v1/private/traces/{id}/feedback-scores/delete
pub async fn delete_trace_score(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
    ApiJson(request): ApiJson<DeleteFeedbackScore>,
) -> Result<StatusCode, ApiError> {
    delete_score(state, auth, EntityType::Trace, raw_id, request).await
}

/// PUT /v1/private/traces/feedback-scores
pub async fn batch_trace_scores(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ApiJson(batch): ApiJson<FeedbackScoreBatch>,
) -> Result<StatusCode, ApiError> {
    batch_scores(state, auth, EntityType::Trace, batch).await
}

#[derive(Debug, Deserialize)]
pub struct ScoreNamesQuery {
    pub project_id: Uuid,
}

async fn score_names(
    state: AppState,
    auth: AuthContext,
    entity_type: EntityType,
    query: ScoreNamesQuery,
) -> Result<Json<Vec<String>>, ApiError> {
    let project = crate::api::resolve_project_scope(&state, &auth, None, Some(query.project_id))
        .await?;
    let names = state
        .storage
        .feedback
        .names(&auth.workspace_id, entity_type, project.id)
        .await?;
    Ok(Json(names))
}

/// GET /v1/private/spans/feedback-scores/names
pub async fn span_score_names(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ScoreNamesQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    score_names(state, auth, EntityType::Span, query).await
}

/// GET /v1/private/traces/feedback-scores/names
pub async fn trace_score_names(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ScoreNamesQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    score_names(state, auth, EntityType::Trace, query).await
}
