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

//! Authentication.
//!
//! Every request carries an `Authorization: <api_key>` header or a
//! `sessionToken` cookie plus a `workspaceName` header. Validation is
//! delegated to the remote policy service and its decision cached in
//! memory. Without a configured policy service the server runs in local
//! mode and trusts the workspace header. Anonymous requests pass through
//! the middleware; write endpoints and private-project reads reject them
//! later.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use moka::sync::Cache;
use serde::Deserialize;
use tracing::debug;

use crate::api::AppState;
use crate::error::ApiError;

pub const WORKSPACE_HEADER: &str = "workspaceName";
pub const DEFAULT_WORKSPACE: &str = "default";
const SESSION_COOKIE: &str = "sessionToken";

/// Resolved identity of a request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub workspace_id: String,
    pub workspace_name: String,
    pub username: String,
    pub quota_exceeded: bool,
    pub anonymous: bool,
}

#[derive(Debug, Clone)]
enum Credentials {
    ApiKey(String),
    Session(String),
}

#[derive(Debug, Deserialize)]
struct PolicyQuota {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: String,
    used: u64,
    limit: u64,
}

#[derive(Debug, Deserialize)]
struct PolicyResponse {
    workspace_id: String,
    user: String,
    #[serde(default)]
    quotas: Vec<PolicyQuota>,
}

pub struct AuthService {
    policy_url: Option<String>,
    http: reqwest::Client,
    cache: Cache<String, AuthContext>,
}

impl AuthService {
    pub fn new(policy_url: Option<String>, cache_ttl: Duration) -> Self {
        Self {
            policy_url,
            http: reqwest::Client::new(),
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(cache_ttl)
                .build(),
        }
    }

    async fn authenticate(
        &self,
        credentials: Option<Credentials>,
        workspace_name: &str,
    ) -> Result<AuthContext, ApiError> {
        let Some(credentials) = credentials else {
            return Ok(AuthContext {
                workspace_id: workspace_name.to_string(),
                workspace_name: workspace_name.to_string(),
                username: "anonymous".to_string(),
                quota_exceeded: false,
                anonymous: true,
            });
        };

        let Some(policy_url) = &self.policy_url else {
            // Local mode: the workspace header is the tenancy.
            return Ok(AuthContext {
                workspace_id: workspace_name.to_string(),
                workspace_name: workspace_name.to_string(),
                username: "local".to_string(),
                quota_exceeded: false,
                anonymous: false,
            });
        };

        let cache_key = match &credentials {
            Credentials::ApiKey(key) => format!("key:{key}:{workspace_name}"),
            Credentials::Session(token) => format!("session:{token}:{workspace_name}"),
        };
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached);
        }

        let mut request = self
            .http
            .post(policy_url)
            .json(&serde_json::json!({ "workspace_name": workspace_name }));
        request = match &credentials {
            Credentials::ApiKey(key) => request.header(reqwest::header::AUTHORIZATION, key),
            Credentials::Session(token) => {
                request.header(reqwest::header::COOKIE, format!("{SESSION_COOKIE}={token}"))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Internal(format!("auth service unreachable: {e}")))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            // Pass the policy service payload through verbatim.
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Unauthorized(body));
        }
        if !response.status().is_success() {
            return Err(ApiError::Internal(format!(
                "auth service returned {}",
                response.status()
            )));
        }

        let policy: PolicyResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Internal(format!("malformed auth response: {e}")))?;
        let context = AuthContext {
            workspace_id: policy.workspace_id,
            workspace_name: workspace_name.to_string(),
            username: policy.user,
            quota_exceeded: policy.quotas.iter().any(|q| q.used >= q.limit),
            anonymous: false,
        };
        self.cache.insert(cache_key, context.clone());
        debug!(workspace = workspace_name, user = %context.username, "authenticated");
        Ok(context)
    }
}

fn extract_credentials(request: &Request) -> Option<Credentials> {
    if let Some(value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if !value.trim().is_empty() {
            return Some(Credentials::ApiKey(value.trim().to_string()));
        }
    }
    let cookies = request
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| Credentials::Session(value.to_string()))
    })
}

/// Layer applied to every `/v1/private` route.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let workspace_name = request
        .headers()
        .get(WORKSPACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(DEFAULT_WORKSPACE)
        .to_string();
    let credentials = extract_credentials(&request);
    let context = state.auth.authenticate(credentials, &workspace_name).await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

/// Write endpoints are never public, and the quota gate runs before any
/// other work.
pub fn ensure_write_allowed(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.anonymous {
        return Err(ApiError::Unauthorized(
            "authentication required".to_string(),
        ));
    }
    crate::quota::check(auth)
}
