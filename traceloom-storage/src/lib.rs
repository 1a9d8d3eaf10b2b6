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

//! Versioned upsert store for traces and spans over ClickHouse.
//!
//! Every write becomes a new row keyed `(workspace_id, id, last_updated_at)`;
//! reads always take the latest version per id. The merge of a new write
//! against the stored latest happens in [`merge`], and the analytics store's
//! linearization of same-row inserts is the serialization contract for
//! concurrent writers.

pub mod attachments;
pub mod client;
pub mod comments;
pub mod error;
pub mod feedback;
pub mod merge;
pub mod project;
pub mod rows;
pub mod schema;
pub mod spans;
pub mod sql;
pub mod stats;
pub mod traces;

use std::sync::Arc;

pub use client::StoreClient;
pub use error::StoreError;
pub use project::{InMemoryProjectCatalog, Project, ProjectCatalog, Visibility, DEFAULT_PROJECT};

/// Bundle of the stores sharing one ClickHouse client.
#[derive(Clone)]
pub struct Storage {
    pub spans: spans::SpanStore,
    pub traces: traces::TraceStore,
    pub feedback: feedback::FeedbackStore,
    pub comments: comments::CommentStore,
    pub attachments: attachments::AttachmentIndex,
}

impl Storage {
    pub fn new(client: Arc<StoreClient>, pricing: Arc<traceloom_core::cost::PricingTable>) -> Self {
        Self {
            spans: spans::SpanStore::new(client.clone(), pricing.clone()),
            traces: traces::TraceStore::new(client.clone(), pricing),
            feedback: feedback::FeedbackStore::new(client.clone()),
            comments: comments::CommentStore::new(client.clone()),
            attachments: attachments::AttachmentIndex::new(client),
        }
    }
}
