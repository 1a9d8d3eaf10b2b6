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

//! API error type.
//!
//! Everything a handler can fail with, mapped onto the status table the API
//! promises. Bodies are `{"code": <status>, "message": <text>}` except
//! multi-field validation, which returns `{"errors": [..]}`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use traceloom_storage::StoreError;

pub const QUOTA_MESSAGE: &str = "Usage limit exceeded";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{QUOTA_MESSAGE}")]
    QuotaExceeded,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// 422 with a single message (batch caps, duplicate ids).
    #[error("{0}")]
    Unprocessable(String),

    /// 422 with the accumulated per-field messages.
    #[error("validation failed")]
    Validation(Vec<String>),

    #[error("{0}")]
    Internal(String),

    #[error("not implemented")]
    NotImplemented,
}

#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

#[derive(Serialize)]
struct ErrorsBody {
    errors: Vec<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unprocessable(_) | ApiError::Validation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        };
        if let ApiError::Validation(errors) = self {
            return (status, Json(ErrorsBody { errors })).into_response();
        }
        let message = self.to_string();
        (
            status,
            Json(ErrorBody {
                code: status.as_u16(),
                message,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => ApiError::Conflict(message),
            StoreError::NotFound => ApiError::NotFound("not found".to_string()),
            StoreError::Validation(message) => ApiError::Validation(vec![message]),
            StoreError::Unavailable { .. } => ApiError::Internal(err.to_string()),
            StoreError::Database(inner) => {
                tracing::error!(error = %inner, "analytics store failure");
                ApiError::Internal("internal server error".to_string())
            }
        }
    }
}

impl ApiError {
    pub fn invalid_uuid(raw: &str) -> Self {
        ApiError::BadRequest(format!("'{raw}' is not a valid version-7 UUID"))
    }
}

/// JSON body extractor whose rejections are deserialization errors: always
/// a 400, whether the JSON is malformed or a field (a timestamp without its
/// `Z`, an oversized string) fails to parse.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_error_has_the_fixed_message() {
        assert_eq!(ApiError::QuotaExceeded.to_string(), "Usage limit exceeded");
    }
}
