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

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Immutable-field or project/workspace divergence; the message is part
    /// of the API contract.
    #[error("{0}")]
    Conflict(String),

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Validation(String),

    /// Retries exhausted against the analytics store. The correlation id is
    /// logged alongside the underlying error and returned to the caller.
    #[error("analytics store unavailable (correlation id {correlation_id})")]
    Unavailable {
        correlation_id: Uuid,
        #[source]
        source: clickhouse::error::Error,
    },

    #[error(transparent)]
    Database(#[from] clickhouse::error::Error),
}

impl StoreError {
    pub fn conflict(message: impl Into<String>) -> Self {
        StoreError::Conflict(message.into())
    }
}
