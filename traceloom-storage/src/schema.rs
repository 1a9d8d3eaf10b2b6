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

//! Schema migrations.
//!
//! Every statement is idempotent (`IF NOT EXISTS`), so the whole list runs
//! on every startup. Entities are versioned: each logical write is one row,
//! `last_updated_at` is the version column, and reads collapse to the
//! newest row per key. Timestamps are Int64 nanoseconds since the epoch.

use crate::client::StoreClient;
use crate::error::StoreError;

const MIGRATIONS: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS traces
(
    workspace_id                 String,
    project_id                   UUID,
    id                           UUID,
    name                         String,
    start_time                   Int64,
    end_time                     Nullable(Int64),
    input                        String CODEC(ZSTD(1)),
    output                       String CODEC(ZSTD(1)),
    metadata                     String CODEC(ZSTD(1)),
    tags                         Array(String),
    usage_keys                   Array(String),
    usage_values                 Array(Int64),
    error_info                   String,
    thread_id                    String,
    total_estimated_cost         Float64,
    total_estimated_cost_version LowCardinality(String),
    created_at                   Int64,
    created_by                   String,
    last_updated_at              Int64,
    last_updated_by              String,
    INDEX idx_thread_id thread_id TYPE bloom_filter(0.01) GRANULARITY 1
)
ENGINE = ReplacingMergeTree(last_updated_at)
ORDER BY (workspace_id, project_id, id)
SETTINGS index_granularity = 8192",

    r"CREATE TABLE IF NOT EXISTS spans
(
    workspace_id                 String,
    project_id                   UUID,
    id                           UUID,
    trace_id                     UUID,
    parent_span_id               UUID,
    name                         String,
    span_type                    LowCardinality(String),
    start_time                   Int64,
    end_time                     Nullable(Int64),
    input                        String CODEC(ZSTD(1)),
    output                       String CODEC(ZSTD(1)),
    metadata                     String CODEC(ZSTD(1)),
    model                        LowCardinality(String),
    provider                     LowCardinality(String),
    tags                         Array(String),
    usage_keys                   Array(String),
    usage_values                 Array(Int64),
    error_info                   String,
    thread_id                    String,
    total_estimated_cost         Float64,
    total_estimated_cost_version LowCardinality(String),
    created_at                   Int64,
    created_by                   String,
    last_updated_at              Int64,
    last_updated_by              String,
    INDEX idx_trace_id trace_id TYPE bloom_filter(0.001) GRANULARITY 1
)
ENGINE = ReplacingMergeTree(last_updated_at)
ORDER BY (workspace_id, project_id, id)
SETTINGS index_granularity = 8192",

    r"CREATE TABLE IF NOT EXISTS feedback_scores
(
    workspace_id    String,
    project_id      UUID,
    entity_type     LowCardinality(String),
    entity_id       UUID,
    name            String,
    category_name   String,
    value_nanos     Int64,
    reason          String,
    source          LowCardinality(String),
    created_at      Int64,
    created_by      String,
    last_updated_at Int64,
    last_updated_by String
)
ENGINE = ReplacingMergeTree(last_updated_at)
ORDER BY (workspace_id, entity_type, entity_id, name, created_by)
SETTINGS index_granularity = 8192",

    r"CREATE TABLE IF NOT EXISTS comments
(
    workspace_id    String,
    project_id      UUID,
    entity_type     LowCardinality(String),
    entity_id       UUID,
    id              UUID,
    text            String CODEC(ZSTD(1)),
    created_at      Int64,
    created_by      String,
    last_updated_at Int64,
    last_updated_by String
)
ENGINE = ReplacingMergeTree(last_updated_at)
ORDER BY (workspace_id, entity_type, entity_id, id)
SETTINGS index_granularity = 8192",

    r"CREATE TABLE IF NOT EXISTS attachments
(
    workspace_id String,
    project_id   UUID,
    entity_type  LowCardinality(String),
    entity_id    UUID,
    file_name    String,
    mime_type    LowCardinality(String),
    file_size    UInt64,
    source       LowCardinality(String),
    created_at   Int64
)
ENGINE = ReplacingMergeTree(created_at)
ORDER BY (workspace_id, project_id, entity_type, entity_id, file_name)
SETTINGS index_granularity = 8192",
];

/// Apply all migrations; safe to call on every boot.
pub async fn run_migrations(client: &StoreClient) -> Result<(), StoreError> {
    for sql in MIGRATIONS {
        client
            .with_retries("migrate", |c| {
                let sql = *sql;
                async move { c.query(sql).execute().await }
            })
            .await?;
    }
    tracing::info!(statements = MIGRATIONS.len(), "schema migrations applied");
    Ok(())
}
