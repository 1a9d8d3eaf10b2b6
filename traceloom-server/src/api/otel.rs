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

//! OTLP ingest: one endpoint, protobuf or JSON by content type. Metrics are
//! not served.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use prost::Message;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use traceloom_core::attachment::AttachmentContext;
use traceloom_core::types::EntityType;
use traceloom_storage::merge::WriteContext;

use crate::api::{resolve_or_create_project, strip_entity_bodies, AppState};
use crate::auth::{ensure_write_allowed, AuthContext};
use crate::error::ApiError;

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

#[derive(Debug, Deserialize)]
pub struct OtelIngestQuery {
    pub project_name: Option<String>,
}

/// POST /otel/v1/traces
#[instrument(skip_all)]
pub async fn ingest_otel_traces(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<OtelIngestQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    ensure_write_allowed(&auth)?;

    let is_protobuf = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with(PROTOBUF_CONTENT_TYPE))
        .unwrap_or(false);

    let request: ExportTraceServiceRequest = if is_protobuf {
        ExportTraceServiceRequest::decode(body.as_ref())
            .map_err(|e| ApiError::BadRequest(format!("Invalid OTLP protobuf payload: {e}")))?
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid OTLP JSON payload: {e}")))?
    };

    let translated = state.otel.translate(&auth.workspace_id, &request);
    debug!(
        traces = translated.traces.len(),
        spans = translated.spans.len(),
        "otlp batch translated"
    );

    let project = resolve_or_create_project(&state, &auth, query.project_name.as_deref()).await?;
    let now = Utc::now();

    let mut trace_items = Vec::with_capacity(translated.traces.len());
    for (id, mut write) in translated.traces {
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
        trace_items.push((ctx, id, write));
    }

    let mut span_items = Vec::with_capacity(translated.spans.len());
    for (id, mut write) in translated.spans {
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
        span_items.push((ctx, id, write));
    }

    let trace_outcome = state.storage.traces.create_batch(trace_items).await?;
    let span_outcome = state.storage.spans.create_batch(span_items).await?;
    if !trace_outcome.errors.is_empty() || !span_outcome.errors.is_empty() {
        warn!(
            trace_errors = ?trace_outcome.errors,
            span_errors = ?span_outcome.errors,
            "otlp batch items rejected"
        );
    }

    let response = ExportTraceServiceResponse::default();
    if is_protobuf {
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)],
            response.encode_to_vec(),
        )
            .into_response())
    } else {
        Ok((StatusCode::OK, Json(response)).into_response())
    }
}

/// POST /otel/v1/metrics
pub async fn ingest_otel_metrics() -> ApiError {
    ApiError::NotImplemented
}
