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

use axum::Json;
use serde_json::{json, Value};

/// GET /health: liveness probe, unauthenticated.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "traceloom",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
