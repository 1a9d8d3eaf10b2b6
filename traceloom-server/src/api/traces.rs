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

//! Trace endpoints.

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
use traceloom_core::types::{EntityType, Page, Trace, TraceBatch, TraceUpdate, TraceWrite};
use traceloom_core::validation::{check_batch_cap, find_duplicate_id, validate_trace_write};
use traceloom_core::{ids, Patch};
use traceloom_storage::merge::WriteContext;
use traceloom_storage::traces::{TraceListCriteria, TraceStreamCriteria};

use crate::api::{
    parse_entity_id, parse_filters, parse_sorting, reinject_entity_bodies,
    resolve_or_create_project, resolve_project_scope, strip_entity_bodies, AppState,
};
use crate::auth::{ensure_write_allowed, AuthContext};
use crate::error::{ApiError, ApiJson};
use crate::selector::{self, ExcludableField};
use crate::stream;

#[derive(Debug, Deserialize)]
pub struct TraceListQuery {
    pub project_name: Option<String>,
    pub project_id: Option<Uuid>,
    pub thread_id: Option<String>,
    pub filters: Option<String>,
    pub sorting: Option<String>,
    pub page: Option<usize>,
    pub size: Option<usize>,
    pub truncate: Option<bool>,
    pub exclude: Option<String>,
    pub strip_attachments: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TraceGetQuery {
    pub truncate: Option<bool>,
    pub strip_attachments: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TraceSearchRequest {
    pub project_name: Option<String>,
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub filters: Vec<traceloom_core::filter::FilterClause>,
    pub limit: Option<usize>,
    pub last_retrieved_id: Option<Uuid>,
    pub truncate: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TraceStatsQuery {
    pub project_name: Option<String>,
    pub project_id: Option<Uuid>,
    pub filters: Option<String>,
}

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

async fn finalize_traces(
    state: &AppState,
    workspace_id: &str,
    mut traces: Vec<Trace>,
    options: &ReadOptions,
) -> Result<Vec<Trace>, ApiError> {
    let ids: Vec<Uuid> = traces.iter().map(|t| t.id).collect();
    let mut scores = state
        .storage
        .feedback
        .for_entities(workspace_id, EntityType::Trace, &ids)
        .await?;
    let mut comments = state
        .storage
        .comments
        .for_entities(workspace_id, EntityType::Trace, &ids)
        .await?;

    for trace in &mut traces {
        trace.feedback_scores = scores.remove(&trace.id);
        trace.comments = comments.remove(&trace.id);

        if !options.strip_attachments && !options.truncate {
            let project_id = trace.project_id;
            let trace_id = trace.id;
            let mut trees = [
                trace.input.as_mut(),
                trace.output.as_mut(),
                trace.metadata.as_mut(),
            ];
            reinject_entity_bodies(
                state,
                workspace_id,
                project_id,
                EntityType::Trace,
                trace_id,
                &mut trees,
            )
            .await?;
        }

        if options.truncate {
            for tree in [&mut trace.input, &mut trace.output, &mut trace.metadata] {
                if let Some(value) = tree.take() {
                    *tree = Some(state.stripper.truncate(value));
                }
            }
        }

        selector::apply_to_trace(trace, &options.exclude);
    }
    Ok(traces)
}

/// POST /v1/private/traces
#[instrument(skip_all, fields(trace_id))]
pub async fn create_trace(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ApiJson(mut write): ApiJson<TraceWrite>,
) -> Result<Response, ApiError> {
    ensure_write_allowed(&auth)?;

    let id = match write.id {
        Some(id) => {
            ids::require_v7(&id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
            id
        }
        None => ids::new_v7(),
    };
    tracing::Span::current().record("trace_id", tracing::field::display(id));
    validate_trace_write(&write).map_err(ApiError::Validation)?;

    let project = resolve_or_create_project(&state, &auth, write.project_name.as_deref()).await?;
    strip_entity_bodies(
        &state,
        &auth.workspace_id,
        project.id,
        EntityType::Trace,
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
    state.storage.traces.create(&ctx, id, &write).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))).into_response())
}

/// POST /v1/private/traces/batch
#[instrument(skip_all, fields(count = batch.traces.len()))]
pub async fn create_traces_batch(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ApiJson(batch): ApiJson<TraceBatch>,
) -> Result<StatusCode, ApiError> {
    ensure_write_allowed(&auth)?;
    check_batch_cap(batch.traces.len(), "traces").map_err(ApiError::Unprocessable)?;
    if let Some(duplicate) = find_duplicate_id(batch.traces.iter().map(|t| t.id.as_ref())) {
        return Err(ApiError::Unprocessable(format!(
            "Duplicate trace id '{duplicate}'"
        )));
    }
    for trace in &batch.traces {
        if let Some(id) = &trace.id {
            ids::require_v7(id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        }
        validate_trace_write(trace).map_err(ApiError::Validation)?;
    }

    let now = Utc::now();
    let mut items = Vec::with_capacity(batch.traces.len());
    for mut write in batch.traces {
        let id = write.id.unwrap_or_else(ids::new_v7);
        let project =
            resolve_or_create_project(&state, &auth, write.project_name.as_deref()).await?;
        strip_entity_bodies(
            &state,
            &auth.workspace_id,
            project.id,
            EntityType::Trace,
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

    let outcome = state.storage.traces.create_batch(items).await?;
    if !outcome.errors.is_empty() {
        warn!(errors = ?outcome.errors, "trace batch items rejected");
    }
    debug!(
        written = outcome.written,
        stale = outcome.dropped_stale,
        "trace batch ingested"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /v1/private/traces/{id}
#[instrument(skip_all, fields(trace_id = %raw_id))]
pub async fn update_trace(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
    ApiJson(mut update): ApiJson<TraceUpdate>,
) -> Result<StatusCode, ApiError> {
    ensure_write_allowed(&auth)?;
    let id = parse_entity_id(&raw_id)?;
    if let Some(cost) = update.total_estimated_cost {
        if cost.is_sign_negative() && !cost.is_zero() {
            return Err(ApiError::Validation(vec![
                "total_estimated_cost must not be negative".to_string(),
            ]));
        }
    }

    let project_id = match &update.project_name {
        Some(name) => resolve_or_create_project(&state, &auth, Some(name)).await?.id,
        None => match state
            .storage
            .traces
            .find_latest(&auth.workspace_id, id)
            .await?
        {
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
        EntityType::Trace,
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
    state.storage.traces.update(&ctx, id, &update).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn patch_tree(patch: &mut Patch<serde_json::Value>) -> Option<&mut serde_json::Value> {
    match patch {
        Patch::Set(value) => Some(value),
        _ => None,
    }
}

/// GET /v1/private/traces/{id}
pub async fn get_trace_by_id(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(raw_id): Path<String>,
    Query(query): Query<TraceGetQuery>,
) -> Result<Json<Trace>, ApiError> {
    let id = parse_entity_id(&raw_id)?;
    let trace = state.storage.traces.get(&auth.workspace_id, id).await?;

    if let Some(project) = state
        .projects
        .find_by_id(&auth.workspace_id, trace.project_id)
        .await
    {
        crate::api::require_read_access(&auth, &project)?;
    } else if auth.anonymous {
        return Err(ApiError::Unauthorized("authentication required".to_string()));
    }

    let options = ReadOptions::new(query.strip_attachments, query.truncate);
    let mut traces = finalize_traces(&state, &auth.workspace_id, vec![trace], &options).await?;
    Ok(Json(traces.remove(0)))
}

/// GET /v1/private/traces
pub async fn list_traces(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<TraceListQuery>,
) -> Result<Json<Page<Trace>>, ApiError> {
    let project = resolve_project_scope(
        &state,
        &auth,
        query.project_name.as_deref(),
        query.project_id,
    )
    .await?;

    let criteria = TraceListCriteria {
        thread_id: query.thread_id,
        filters: parse_filters(FilterEntity::Trace, query.filters.as_deref())?,
        sorting: parse_sorting(query.sorting.as_deref())?,
        page: query.page.unwrap_or(1),
        size: query.size.unwrap_or(10).clamp(1, 1_000),
    };
    let page = state
        .storage
        .traces
        .list(&auth.workspace_id, project.id, &criteria)
        .await?;

    let options = ReadOptions::new(query.strip_attachments, query.truncate)
        .with_exclude(selector::parse_exclude(query.exclude.as_deref())?);
    let mut content = finalize_traces(&state, &auth.workspace_id, page.content, &options).await?;
    for trace in &mut content {
        trace.project_name = Some(project.name.clone());
    }

    Ok(Json(Page {
        page: page.page,
        size: page.size,
        total: page.total,
        content,
    }))
}

/// POST /v1/private/traces/search: chunked NDJSON stream in `id DESC` order.
pub async fn search_traces(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ApiJson(request): ApiJson<TraceSearchRequest>,
) -> Result<Response, ApiError> {
    let project = resolve_project_scope(
        &state,
        &auth,
        request.project_name.as_deref(),
        request.project_id,
    )
    .await?;
    traceloom_core::filter::validate_filters(FilterEntity::Trace, &request.filters)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let base = TraceStreamCriteria {
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
                let traces = state
                    .storage
                    .traces
                    .stream_chunk(&workspace_id, project_id, &criteria)
                    .await?;
                Ok(traces
                    .into_iter()
                    .map(|mut trace| {
                        if truncate {
                            for tree in
                                [&mut trace.input, &mut trace.output, &mut trace.metadata]
                            {
                                if let Some(value) = tree.take() {
                                    *tree = Some(state.stripper.truncate(value));
                                }
                            }
                        }
                        (trace.id, trace)
                    })
                    .collect())
            }
        },
    ))
}

/// GET /v1/private/traces/stats
pub async fn trace_stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<TraceStatsQuery>,
) -> Result<Json<traceloom_storage::stats::StatsSummary>, ApiError> {
    let project = resolve_project_scope(
        &state,
        &auth,
        query.project_name.as_deref(),
        query.project_id,
    )
    .await?;
    let filters = parse_filters(FilterEntity::Trace, query.filters.as_deref())?;
    let summary = state
        .storage
        .traces
        .stats(&auth.workspace_id, project.id, &filters)
        .await?;
    Ok(Json(summary))
}
