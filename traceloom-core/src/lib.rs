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

//! Core domain model for Traceloom.
//!
//! Everything the storage and server crates share lives here: trace and span
//! records with their create/patch payloads, feedback scores, comments,
//! attachment reference tokens, the filter and sorting DSL with its
//! per-field validation tables, cost estimation, and the strict timestamp
//! and UUIDv7 handling the wire format requires.

pub mod attachment;
pub mod comment;
pub mod cost;
pub mod feedback;
pub mod filter;
pub mod ids;
pub mod patch;
pub mod time;
pub mod types;
pub mod validation;

pub use patch::Patch;
pub use types::{
    EntityType, ErrorInfo, Page, Span, SpanBatch, SpanType, SpanUpdate, SpanWrite, Trace,
    TraceBatch, TraceUpdate, TraceWrite,
};
