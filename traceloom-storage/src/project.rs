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

//! Project catalog.
//!
//! Projects are referenced by name within a workspace and auto-created on
//! first ingest. The authoritative rows live in the external relational
//! store; this trait is the contract the core needs from it, and the
//! in-memory implementation backs single-node deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

/// Name a trace lands in when the client does not say otherwise.
pub const DEFAULT_PROJECT: &str = "Default Project";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Public,
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: Uuid,
    pub workspace_id: String,
    pub name: String,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    async fn find_by_name(&self, workspace_id: &str, name: &str) -> Option<Project>;
    async fn find_by_id(&self, workspace_id: &str, id: Uuid) -> Option<Project>;
    /// Idempotent; first ingest wins the creation race.
    async fn resolve_or_create(&self, workspace_id: &str, name: &str) -> Project;
}

/// Keyed twice so both lookup directions are O(1).
#[derive(Default)]
pub struct InMemoryProjectCatalog {
    by_name: DashMap<(String, String), Project>,
    by_id: DashMap<(String, Uuid), Project>,
}

impl InMemoryProjectCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a project with explicit visibility (tests, public demos).
    pub fn insert(&self, project: Project) {
        self.by_id.insert(
            (project.workspace_id.clone(), project.id),
            project.clone(),
        );
        self.by_name.insert(
            (project.workspace_id.clone(), project.name.clone()),
            project,
        );
    }
}

#[async_trait]
impl ProjectCatalog for InMemoryProjectCatalog {
    async fn find_by_name(&self, workspace_id: &str, name: &str) -> Option<Project> {
        self.by_name
            .get(&(workspace_id.to_string(), name.to_string()))
            .map(|p| p.clone())
    }

    async fn find_by_id(&self, workspace_id: &str, id: Uuid) -> Option<Project> {
        self.by_id
            .get(&(workspace_id.to_string(), id))
            .map(|p| p.clone())
    }

    async fn resolve_or_create(&self, workspace_id: &str, name: &str) -> Project {
        let key = (workspace_id.to_string(), name.to_string());
        let project = self
            .by_name
            .entry(key)
            .or_insert_with(|| Project {
                id: Uuid::now_v7(),
                workspace_id: workspace_id.to_string(),
                name: name.to_string(),
                visibility: Visibility::Private,
                created_at: Utc::now(),
            })
            .clone();
        self.by_id
            .insert((project.workspace_id.clone(), project.id), project.clone());
        project
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_or_create_is_idempotent() {
        let catalog = InMemoryProjectCatalog::new();
        let first = catalog.resolve_or_create("ws", "demo").await;
        let second = catalog.resolve_or_create("ws", "demo").await;
        assert_eq!(first.id, second.id);

        let by_id = catalog.find_by_id("ws", first.id).await.unwrap();
        assert_eq!(by_id.name, "demo");
    }

    #[tokio::test]
    async fn projects_are_workspace_scoped() {
        let catalog = InMemoryProjectCatalog::new();
        let a = catalog.resolve_or_create("ws-a", "demo").await;
        let b = catalog.resolve_or_create("ws-b", "demo").await;
        assert_ne!(a.id, b.id);
        assert!(catalog.find_by_id("ws-a", b.id).await.is_none());
    }
}
