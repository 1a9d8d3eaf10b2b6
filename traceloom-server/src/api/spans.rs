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

//! Span endpoints: create, batch create, partial update, get, list,
//! search stream, and stats.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use traceloom_core::attachment::AttachmentContext;
use traceloom_core::filter::FilterEntity;
use traceloom_core::types::{
    EntityType, Page, Span, SpanBatch, SpanType, SpanUpdate, SpanWrite,
};
use traceloom_core::validation::{check_batch_cap, find_duplicate_id, validate_span_write};
use traceloom_core::{ids, Patch};
use traceloom_storage::merge::WriteContext;
use traceloom_storage::spans::{SpanListCriteria, SpanStreamCriteria};

use crate::api::{
    parse_entity_id, parse_filters, parse_sorting, reinject_entity_bodies,
    resolve_or_create_project, resolve_project_scope, strip_entity_bodies, AppState,
};
use crate::auth::{ensure_write_allowed, AuthContext};
use crate::error::{ApiError, ApiJson};
use crate::selector::{self, ExcludableField};
use crate::stream;

#[derive(Debug, Deserialize)]
pub struct SpanListQuery {
    pub project_name: Option<String>,
    pub project_id: Option<Uuid>,
    pub trace_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub span_type: Option<SpanType>,
    pub filters: Option<String>,
    pub sorting: Option<String>,
    pub page: Option<usize>,
    pub size: Option<usize>,
    pub truncate: Option<bool>,
    pub exclude: Option<String>,
    pub strip_attachments: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SpanGetQuery {
    pub truncate: Option<bool>,
    pub strip_attachments: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SpanSearchRequest {
    pub project_name: Option<String>,
    pub project_id: Option<Uuid>,
    pub trace_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub span_type: Option<SpanType>,
    #[serde(default)]
    pub filters: Vec<traceloom_core::filter::FilterClause>,
    pub limit: Option<usize>,
    pub last_retrieved_id: Option<Uuid>,
    pub truncate: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SpanStatsQuery {
    pub project_name: Option<String>,
    pub project_id: Option<Uuid>,
    pub trace_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub span_type: Option<SpanType>,
    pub filters: Option<String>,
}

/// `trace_id` and `parent_span_id` are entity ids too: version 7 or a 400.
fn check_span_refs(
    trace_id: Option<&Uuid>,
    parent_span_id: Option<&Uuid>,
) -> Result<(), ApiError> {
    for id in [trace_id, parent_span_id].into_iter().flatten() {
        ids::require_v7(id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }
    Ok(())
}

/// Read-side shaping shared by get, list, and search.
struct ReadOptions {
    strip_attachments: bool,
    truncate: bool,
    exclude: Vec<ExcludableField>,
}

impl ReadOptions {
    fn new(strip_attachments: Option<bool>, truncate: Option<bool>) -> Self {
        Self {
            strip_attachments: strip_attachments.unwrap_or(true),
            truncate: truncate.unwrap_or(false),
            exclude: Vec::new(),
        }
    }

    fn with_exclude(mut self, exclude: Vec<ExcludableField>) -> Self {
        self.exclude = exclude;
        self
    }
}

async fn finalize_spans(
    state: &AppState,
    workspace_id: &str,
    mut spans: Vec<Span>,
    options: &ReadOptions,
) -> Result<Vec<Span>, ApiError> {
    let ids: Vec<Uuid> = spans.iter().map(|s| s.id).collect();
    let mut scores = state
        .storage
        .feedback
        .for_entities(workspace_id, EntityType::Span, &ids)
        .await?;
    let mut comments = state
        .storage
        .comments
        .for_entities(workspace_id, EntityType::Span, &ids)
        .await?;

    for span in &mut spans {
        span.feedback_scores = scores.remove(&span.id);
        span.comments = comments.remove(&span.id);

        if !options.strip_attachments && !options.truncate {
            let project_id = span.project_id;
            let span_id = span.id;
            let mut trees = [
                span.input.as_mut(),
                span.output.as_mut(),
                span.metadata.as_mut(),
            ];
            reinject_entity_bodies(
                state,
                workspace_id,
                project_id,
                EntityType::Span,
                span_id,
                &mut trees,
            )
            .await?;
        }

        if options.truncate {
            for tree in [&mut span.input, &mut span.output, &mut span.metadata] {
                if let Some(value) = tree.take() {
                    *tree = Some(state.stripper.truncate(value));
                }
            }
        }

        selector::apply_to_span(span, &options.exclude);
    }
    Ok(spans)
}

/// POST /v1/private/spans
#[instrument(skip_all, fields(span_id))]
pub async fn create_span(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ApiJson(mut write): ApiJson<SpanWrite>,
) -> Result<Response, ApiError> {
    ensure_write_allowed(&auth)?;

    let id = match write.id {
        Some(id) => {
            ids::require_v7(&id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
            id
        }
        None => ids::new_v7(),
    };
    tracing::Span::current().record("span_id", tracing::field::display(id));
    check_span_refs(Some(&write.trace_id), write.parent_span_id.as_ref())?;
    validate_span_write(&write).map_err(ApiError::Validation)?;

    let project = resolve_or_create_project(&state, &auth, write.project_name.as_deref()).await?;
    strip_entity_bodies(
        &state,
        &auth.workspace_id,
        project.id,
        EntityType::Span,
        id,
        [
            (AttachmentContext::Input, write.input.as_mut()),
            (AttachmentContext::Output, write.output.as_mut()),
            (AttachmentContext::Metadata, write.metadata.as_mut()),
        ],
    )
    .await?;

    let ctx = WriteContext {
        workspace_id: auth.workspace_id.clone(),
        project_id: project.id,
        username: auth.username.clone(),
        now: Utc::now(),
    };
    state.storage.spans.create(&ctx, id, &write).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))).into_response())
}

/// POST /v1/private/spans/batch
#[instrument(skip_all, fields(count = batch.spans.len()))]
pub async fn create_spans_batch(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ApiJson(batch): ApiJson<SpanBatch>,
) -> Result<StatusCode, ApiError> {
    ensure_write_allowed(&auth)?;
    check_batch_cap(batch.spans.len(), "spans").map_err(ApiError::Unprocessable)?;
    if let Some(duplicate) = find_duplicate_id(batch.spans.iter().map(|s| s.id.as_ref())) {
        return Err(ApiError::Unprocessable(format!(
            "Duplicate span id '{duplicate}'"
        )));
    }
    for span in &batch.spans {
        if let Some(id) = &span.id {
            ids::require_v7(id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        }
        check_span_refs(Some(&span.trace_id), span.parent_span_id.as_ref())?;
        validate_span_write(span).map_err(ApiError::Validation)?;
    }

    let now = Utc::now();
    let mut items = Vec::with_capacity(batch.spans.len());
    for mut write in batch.spans {
        let id = write.id.unwrap_or_else(ids::new_v7);
        let project =
            resolve_or_create_project(&state, &auth, write.project_name.as_deref()).await?;
        strip_entity_bodies(
            &state,
            &auth.workspace_id,
            project.id,
            EntityType::Span,
            id,
            [
                (AttachmentContext::Input, write.input.as_mut()),
                (AttachmentContext::Output, write.output.as_mut()),
                (AttachmentContext::Metadata, write.metadata.as_mut()),
            ],
        )
        .await?;
        let ctx = WriteContext {
            workspace_id: auth.workspace_id.clone(),
            project_id: project.id,
            username: auth.username.clone(),
            now,
        };
        items.push((ctx, id, write));
    }

    let outcome = state.storage.spans.create_batch(items).await?;
    if !outcome.errors.is_empty() {
        warn!(errors = ?outcome.errors, "span batch items rejected");
    }
    debug!(
        written = outcome.written,
        stale = outcome.dropped_stale,
        "span batch ingested"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /v1/private/spans/{id}
#[instrument(skip_all, fields(span_id = %raw_id))]
pub async fn update_span(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
    ApiJson(mut update): ApiJson<SpanUpdate>,
) -> Result<StatusCode, ApiError> {
    ensure_write_allowed(&auth)?;
    let id = parse_entity_id(&raw_id)?;
    check_span_refs(update.trace_id.as_ref(), update.parent_span_id.as_ref())?;
    if let Some(cost) = update.total_estimated_cost {
        if cost.is_sign_negative() && !cost.is_zero() {
            return Err(ApiError::Validation(vec![
                "total_estimated_cost must not be negative".to_string(),
            ]));
        }
    }

    let project_id = match &update.project_name {
        Some(name) => resolve_or_create_project(&state, &auth, Some(name)).await?.id,
        None => match state.storage.spans.find_latest(&auth.workspace_id, id).await? {
            Some(row) => row.project_id,
            None => resolve_or_create_project(&state, &auth, None).await?.id,
        },
    };

    let input = patch_tree(&mut update.input);
    let output = patch_tree(&mut update.output);
    let metadata = patch_tree(&mut update.metadata);
    strip_entity_bodies(
        &state,
        &auth.workspace_id,
        project_id,
        EntityType::Span,
        id,
        [
            (AttachmentContext::Input, input),
            (AttachmentContext::Output, output),
            (AttachmentContext::Metadata, metadata),
        ],
    )
    .await?;

    let ctx = WriteContext {
        workspace_id: auth.workspace_id.clone(),
        project_id,
        username: auth.username.clone(),
        now: Utc::now(),
    };
    state.storage.spans.update(&ctx, id, &update).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Mutable view into a patch's tree, when one was supplied.
fn patch_tree(patch: &mut Patch<serde_json::Value>) -> Option<&mut serde_json::Value> {
    match patch {
        Patch::Set(value) => Some(value),
        _ => None,
    }
}

/// GET /v1/private/spans/{id}
pub async fn get_span_by_id(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
    Query(query): Query<SpanGetQuery>,
) -> Result<Json<Span>, ApiError> {
    let id = parse_entity_id(&raw_id)?;
    let span = state.storage.spans.get(&auth.workspace_id, id).await?;

    if let Some(project) = state
        .projects
        .find_by_id(&auth.workspace_id, span.project_id)
        .await
    {
        crate::api::require_read_access(&auth, &project)?;
    } else if auth.anonymous {
        return Err(ApiError::Unauthorized("authentication required".to_string()));
    }

    let options = ReadOptions::new(query.strip_attachments, query.truncate);
    let mut spans = finalize_spans(&state, &auth.workspace_id, vec![span], &options).await?;
    Ok(Json(spans.remove(0)))
}

/// DELETE /v1/private/spans/{id}
pub async fn delete_span() -> ApiError {
    ApiError::NotImplemented
}

/// GET /v1/private/spans
pub async fn list_spans(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<SpanListQuery>,
) -> Result<Json<Page<Span>>, ApiError> {
    let project = resolve_project_scope(
        &state,
        &auth,
        query.project_name.as_deref(),
        query.project_id,
    )
    .await?;

    let criteria = SpanListCriteria {
        trace_id: query.trace_id,
        span_type: query.span_type,
        filters: parse_filters(FilterEntity::Span, query.filters.as_deref())?,
        sorting: parse_sorting(query.sorting.as_deref())?,
        page: query.page.unwrap_or(1),
        size: query.size.unwrap_or(10).clamp(1, 1_000),
    };
    let page = state
        .storage
        .spans
        .list(&auth.workspace_id, project.id, &criteria)
        .await?;

    let options = ReadOptions::new(query.strip_attachments, query.truncate)
        .with_exclude(selector::parse_exclude(query.exclude.as_deref())?);
    let mut content = finalize_spans(&state, &auth.workspace_id, page.content, &options).await?;
    for span in &mut content {
        span.project_name = Some(project.name.clone());
    }

    Ok(Json(Page {
        page: page.page,
        size: page.size,
        total: page.total,
        content,
    }))
}

/// POST /v1/private/spans/search: chunked NDJSON stream in `id DESC` order.
pub async fn search_spans(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ApiJson(request): ApiJson<SpanSearchRequest>,
) -> Result<Response, ApiError> {
    let project = resolve_project_scope(
        &state,
        &auth,
        request.project_name.as_deref(),
        request.project_id,
    )
    .await?;
    traceloom_core::filter::validate_filters(FilterEntity::Span, &request.filters)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let base = SpanStreamCriteria {
        trace_id: request.trace_id,
        span_type: request.span_type,
        filters: request.filters.clone(),
        limit: 0,
        last_retrieved_id: None,
    };
    let limit = stream::effective_limit(request.limit);
    let truncate = request.truncate.unwrap_or(false);
    let workspace_id = auth.workspace_id.clone();
    let project_id = project.id;

    Ok(stream::ndjson_response(
        request.last_retrieved_id,
        limit,
        move |cursor, take| {
            let state = state.clone();
            let workspace_id = workspace_id.clone();
            let mut criteria = base.clone();
            criteria.last_retrieved_id = cursor;
            criteria.limit = take;
            async move {
                let spans = state
                    .storage
                    .spans
                    .stream_chunk(&workspace_id, project_id, &criteria)
                    .await?;
                Ok(spans
                    .into_iter()
                    .map(|mut span| {
                        if truncate {
                            for tree in [&mut span.input, &mut span.output, &mut span.metadata] {
                                if let Some(value) = tree.take() {
                                    *tree = Some(state.stripper.truncate(value));
                                }
                            }
                        }
                        (span.id, span)
                    })
                    .collect())
            }
        },
    ))
}

/// GET /v1/private/spans/stats
pub async fn span_stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<SpanStatsQuery>,
) -> Result<Json<traceloom_storage::stats::StatsSummary>, ApiError> {
    let project = resolve_project_scope(
        &state,
        &auth,
        query.project_name.as_deref(),
        query.project_id,
    )
    .await?;
    let filters = parse_filters(FilterEntity::Span, query.filters.as_deref())?;
    let summary = state
        .storage
        .spans
        .stats(
            &auth.workspace_id,
            project.id,
            query.trace_id,
            query.span_type,
            &filters,
        )
        .await?;
    Ok(Json(summary))
}
