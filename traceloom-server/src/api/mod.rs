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

//! HTTP surface under `/v1/private`.

pub mod attachments;
pub mod comments;
pub mod feedback;
pub mod health;
pub mod otel;
pub mod spans;
pub mod traces;

use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::Value;
use uuid::Uuid;

use traceloom_core::filter::{self, FilterClause, FilterEntity, SortClause};
use traceloom_core::ids;
use traceloom_core::types::EntityType;
use traceloom_storage::project::{Project, ProjectCatalog, Visibility, DEFAULT_PROJECT};
use traceloom_storage::Storage;

use crate::attachments::{
    collect_tokens, object_key, reinject, AttachmentStripper, ObjectStore, StrippedFile,
};
use crate::auth::{AuthContext, AuthService};
use crate::error::ApiError;
use crate::otel::OtelTranslator;

#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub projects: Arc<dyn ProjectCatalog>,
    pub auth: Arc<AuthService>,
    pub stripper: Arc<AttachmentStripper>,
    pub object_store: Arc<dyn ObjectStore>,
    pub otel: Arc<OtelTranslator>,
}

/// Path ids must be well-formed v7 UUIDs; anything else is a 400.
pub fn parse_entity_id(raw: &str) -> Result<Uuid, ApiError> {
    let id: Uuid = raw.parse().map_err(|_| ApiError::invalid_uuid(raw))?;
    ids::require_v7(&id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(id)
}

/// Read endpoints are anonymous only on public projects.
pub fn require_read_access(auth: &AuthContext, project: &Project) -> Result<(), ApiError> {
    if auth.anonymous && project.visibility != Visibility::Public {
        return Err(ApiError::Unauthorized(
            "authentication required".to_string(),
        ));
    }
    Ok(())
}

/// List/stats/search scope: exactly one of `project_name` / `project_id`.
pub async fn resolve_project_scope(
    state: &AppState,
    auth: &AuthContext,
    project_name: Option<&str>,
    project_id: Option<Uuid>,
) -> Result<Project, ApiError> {
    let project = match (project_name, project_id) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(ApiError::BadRequest(
                "exactly one of project_name or project_id is required".to_string(),
            ))
        }
        (Some(name), None) => state
            .projects
            .find_by_name(&auth.workspace_id, name)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("Project '{name}' not found")))?,
        (None, Some(id)) => state
            .projects
            .find_by_id(&auth.workspace_id, id)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("Project '{id}' not found")))?,
    };
    require_read_access(auth, &project)?;
    Ok(project)
}

/// Ingest-side project resolution: named project or the default, created on
/// first use.
pub async fn resolve_or_create_project(
    state: &AppState,
    auth: &AuthContext,
    project_name: Option<&str>,
) -> Result<Project, ApiError> {
    let name = project_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(DEFAULT_PROJECT);
    Ok(state
        .projects
        .resolve_or_create(&auth.workspace_id, name)
        .await)
}

/// `filters` arrives as a URL-encoded JSON array; bad JSON and invalid
/// clauses are both 400s.
pub fn parse_filters(
    entity: FilterEntity,
    raw: Option<&str>,
) -> Result<Vec<FilterClause>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let filters: Vec<FilterClause> = serde_json::from_str(raw)
        .map_err(|e| ApiError::BadRequest(format!("Invalid filters: {e}")))?;
    filter::validate_filters(entity, &filters)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(filters)
}

pub fn parse_sorting(raw: Option<&str>) -> Result<Vec<SortClause>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let sorting: Vec<SortClause> = serde_json::from_str(raw)
        .map_err(|e| ApiError::BadRequest(format!("Invalid sorting: {e}")))?;
    filter::validate_sorting(&sorting).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(sorting)
}

/// Strip the body trees of one entity write, fan the extracted payloads out
/// to the object store, and replace the entity's auto-stripped attachment
/// set. User-uploaded attachments survive.
pub async fn strip_entity_bodies(
    state: &AppState,
    workspace_id: &str,
    project_id: Uuid,
    entity_type: EntityType,
    entity_id: Uuid,
    trees: [(traceloom_core::attachment::AttachmentContext, Option<&mut Value>); 3],
) -> Result<(), ApiError> {
    use traceloom_core::attachment::AttachmentSource;
    use traceloom_storage::attachments::AttachmentRecord;

    let now = chrono::Utc::now();
    let nanos = traceloom_core::time::to_nanos(&now).max(0) as u64;
    let mut stripped: Vec<StrippedFile> = Vec::new();
    let mut any_tree = false;

    for (context, tree) in trees {
        if let Some(tree) = tree {
            any_tree = true;
            let mut files = state
                .stripper
                .strip(context, tree, nanos)
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            stripped.append(&mut files);
        }
    }

    if !any_tree {
        return Ok(());
    }

    state
        .storage
        .attachments
        .delete_auto_stripped(workspace_id, project_id, entity_type, entity_id)
        .await?;

    if stripped.is_empty() {
        return Ok(());
    }

    let uploads = stripped.iter().map(|file| {
        let key = object_key(
            workspace_id,
            project_id,
            entity_type,
            entity_id,
            &file.token.file_name(),
        );
        let bytes = file.bytes.clone();
        let store = state.object_store.clone();
        async move { store.put(&key, bytes).await }
    });
    try_join_all(uploads)
        .await
        .map_err(|e| ApiError::Internal(format!("attachment upload failed: {e}")))?;

    let records: Vec<AttachmentRecord> = stripped
        .iter()
        .map(|file| AttachmentRecord {
            project_id,
            entity_type,
            entity_id,
            file_name: file.token.file_name(),
            mime_type: file.mime_type.clone(),
            file_size: file.bytes.len() as u64,
            source: AttachmentSource::AutoStripped,
        })
        .collect();
    state
        .storage
        .attachments
        .record_many(workspace_id, &now, &records)
        .await?;
    Ok(())
}

/// Reverse of stripping: pull every referenced blob back from the object
/// store and inline it where its token sits.
pub async fn reinject_entity_bodies(
    state: &AppState,
    workspace_id: &str,
    project_id: Uuid,
    entity_type: EntityType,
    entity_id: Uuid,
    trees: &mut [Option<&mut Value>],
) -> Result<(), ApiError> {
    let mut tokens = Vec::new();
    for tree in trees.iter() {
        if let Some(tree) = tree {
            collect_tokens(tree, &mut tokens);
        }
    }
    if tokens.is_empty() {
        return Ok(());
    }

    let fetches = tokens.iter().map(|token| {
        let file_name = token.file_name();
        let key = object_key(workspace_id, project_id, entity_type, entity_id, &file_name);
        let store = state.object_store.clone();
        async move {
            store
                .get(&key)
                .await
                .map(|bytes| bytes.map(|b| (file_name, b)))
        }
    });
    let blobs: std::collections::HashMap<_, _> = try_join_all(fetches)
        .await
        .map_err(|e| ApiError::Internal(format!("attachment fetch failed: {e}")))?
        .into_iter()
        .flatten()
        .collect();

    for tree in trees.iter_mut() {
        if let Some(tree) = tree {
            reinject(tree, &blobs);
        }
    }
    Ok(())
}
