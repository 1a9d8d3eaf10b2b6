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

//! Chunked NDJSON delivery for the search endpoints.
//!
//! Results stream as one JSON document per line, fetched in `id DESC`
//! chunks keyed by the `last_retrieved_id` cursor: no id is sent twice, no
//! id is skipped. A client disconnect drops the stream, which finishes the
//! in-flight chunk and stops; a mid-stream store failure is logged and ends
//! the stream rather than corrupting the framing.

use std::convert::Infallible;
use std::future::Future;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiError;

/// Page size of the store reads backing one stream.
pub const STREAM_CHUNK: usize = 500;
/// Cap applied when the request does not bound the stream itself.
pub const DEFAULT_STREAM_LIMIT: usize = 500;
pub const MAX_STREAM_LIMIT: usize = 2_000;

pub fn effective_limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_STREAM_LIMIT).min(MAX_STREAM_LIMIT)
}

/// Build the chunked response. `fetch` returns one `id DESC` chunk strictly
/// below the cursor, paired with each item's id.
pub fn ndjson_response<T, F, Fut>(
    mut cursor: Option<Uuid>,
    mut remaining: usize,
    mut fetch: F,
) -> Response
where
    T: Serialize + Send + 'static,
    F: FnMut(Option<Uuid>, usize) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<(Uuid, T)>, ApiError>> + Send,
{
    let stream = async_stream::stream! {
        while remaining > 0 {
            let take = remaining.min(STREAM_CHUNK);
            match fetch(cursor, take).await {
                Ok(items) => {
                    if items.is_empty() {
                        break;
                    }
                    let got = items.len();
                    cursor = items.last().map(|(id, _)| *id);
                    remaining = remaining.saturating_sub(got);
                    for (_, item) in items {
                        match serde_json::to_vec(&item) {
                            Ok(mut line) => {
                                line.push(b'\n');
                                yield Ok::<_, Infallible>(Bytes::from(line));
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "skipping unserializable row");
                            }
                        }
                    }
                    if got < take {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "search stream aborted");
                    break;
                }
            }
        }
    };

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}
