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

//! Traceloom server: multi-tenant ingestion and query backend for LLM
//! execution traces.

pub mod api;
pub mod attachments;
pub mod auth;
pub mod config;
pub mod error;
pub mod otel;
pub mod quota;
pub mod selector;
pub mod stream;

use std::sync::Arc;

use anyhow::Result;
use axum::middleware as axum_middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use traceloom_core::cost::PricingTable;
use traceloom_storage::{schema, InMemoryProjectCatalog, Storage, StoreClient};

use api::AppState;
use attachments::{AttachmentStripper, FsObjectStore, StripperSettings};
use auth::{auth_middleware, AuthService};
use config::ServerConfig;
use otel::{OtelRuleTable, OtelTranslator};

/// Routes under `/v1/private`.
fn private_routes() -> Router<AppState> {
    Router::new()
        // Traces
        .route(
            "/traces",
            get(api::traces::list_traces).post(api::traces::create_trace),
        )
        .route("/traces/batch", post(api::traces::create_traces_batch))
        .route("/traces/search", post(api::traces::search_traces))
        .route("/traces/stats", get(api::traces::trace_stats))
        .route(
            "/traces/feedback-scores",
            put(api::feedback::batch_trace_scores),
        )
        .route(
            "/traces/feedback-scores/names",
            get(api::feedback::trace_score_names),
        )
        .route(
            "/traces/:id",
            get(api::traces::get_trace_by_id).patch(api::traces::update_trace),
        )
        .route(
            "/traces/:id/feedback-scores",
            put(api::feedback::put_trace_score),
        )
        .route(
            "/traces/:id/feedback-scores/delete",
            post(api::feedback::delete_trace_score),
        )
        .route("/traces/:id/comments", post(api::comments::create_trace_comment))
        // Spans
        .route(
            "/spans",
            get(api::spans::list_spans).post(api::spans::create_span),
        )
        .route("/spans/batch", post(api::spans::create_spans_batch))
        .route("/spans/search", post(api::spans::search_spans))
        .route("/spans/stats", get(api::spans::span_stats))
        .route(
            "/spans/feedback-scores",
            put(api::feedback::batch_span_scores),
        )
        .route(
            "/spans/feedback-scores/names",
            get(api::feedback::span_score_names),
        )
        .route(
            "/spans/:id",
            get(api::spans::get_span_by_id)
                .patch(api::spans::update_span)
                .delete(api::spans::delete_span),
        )
        .route(
            "/spans/:id/feedback-scores",
            put(api::feedback::put_span_score),
        )
        .route(
            "/spans/:id/feedback-scores/delete",
            post(api::feedback::delete_span_score),
        )
        .route("/spans/:id/comments", post(api::comments::create_span_comment))
        // Comments
        .route(
            "/comments/:id",
            get(api::comments::get_comment).patch(api::comments::update_comment),
        )
        .route("/comments/delete", post(api::comments::delete_comments))
        // Attachments
        .route("/attachments", get(api::attachments::list_attachments))
        .route(
            "/attachments/download",
            get(api::attachments::download_attachment),
        )
}

fn otel_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/traces", post(api::otel::ingest_otel_traces))
        .route("/v1/metrics", post(api::otel::ingest_otel_metrics))
}

/// Build the full application router for the given state.
pub fn build_router(state: AppState, enable_cors: bool) -> Router {
    let authed = Router::new()
        .nest("/v1/private", private_routes())
        .nest("/otel", otel_routes())
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let mut app = Router::new()
        .route("/health", get(api::health::health_check))
        .merge(authed)
        .with_state(state)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    app
}

/// Wire the state from configuration.
pub async fn build_state(config: &ServerConfig) -> Result<AppState> {
    let mut client = StoreClient::new(&config.analytics.url, &config.analytics.database);
    if let (Some(user), Some(password)) =
        (&config.analytics.username, &config.analytics.password)
    {
        client = client.with_credentials(user, password);
    }
    let client = Arc::new(client);
    schema::run_migrations(&client).await?;

    let pricing = Arc::new(PricingTable::default());
    let storage = Storage::new(client, pricing);

    Ok(AppState {
        storage,
        projects: Arc::new(InMemoryProjectCatalog::new()),
        auth: Arc::new(AuthService::new(
            config.auth.policy_url.clone(),
            std::time::Duration::from_secs(config.auth.cache_ttl_secs),
        )),
        stripper: Arc::new(AttachmentStripper::new(StripperSettings {
            threshold_chars: config.attachments.strip_threshold_chars,
            max_string_bytes: config.attachments.max_string_bytes,
            truncate_bytes: config.attachments.truncate_bytes,
        })),
        object_store: Arc::new(FsObjectStore::new(config.attachments.data_dir.clone())),
        otel: Arc::new(OtelTranslator::new(OtelRuleTable::default())),
    })
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "traceloom_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting traceloom server");
    config.validate()?;

    let state = build_state(&config).await?;
    let app = build_router(state, config.server.enable_cors);

    let addr = config.socket_addr()?;
    tracing::info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
