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

//! Attachment metadata and the reference tokens left behind in JSON bodies
//! after large base64 payloads are stripped out.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Where in the entity body an attachment was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentContext {
    Input,
    Output,
    Metadata,
}

impl AttachmentContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentContext::Input => "input",
            AttachmentContext::Output => "output",
            AttachmentContext::Metadata => "metadata",
        }
    }
}

/// How an attachment came to exist. Auto-stripped ones are replaced when the
/// owning entity is written again; user uploads survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentSource {
    AutoStripped,
    UserUploaded,
}

impl AttachmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentSource::AutoStripped => "auto_stripped",
            AttachmentSource::UserUploaded => "user_uploaded",
        }
    }
}

impl std::str::FromStr for AttachmentSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_stripped" => Ok(AttachmentSource::AutoStripped),
            "user_uploaded" => Ok(AttachmentSource::UserUploaded),
            other => Err(format!("unknown attachment source '{other}'")),
        }
    }
}

/// The parsed form of a `[<ctx>-attachment-<n>-<nanos>.<ext>]` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentToken {
    pub context: AttachmentContext,
    pub index: u32,
    pub nanos: u64,
    pub extension: String,
}

impl AttachmentToken {
    pub fn file_name(&self) -> String {
        format!(
            "{}-attachment-{}-{}.{}",
            self.context.as_str(),
            self.index,
            self.nanos,
            self.extension
        )
    }

    pub fn render(&self) -> String {
        format!("[{}]", self.file_name())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let caps = token_regex().captures(raw)?;
        let context = match &caps[1] {
            "input" => AttachmentContext::Input,
            "output" => AttachmentContext::Output,
            "metadata" => AttachmentContext::Metadata,
            _ => return None,
        };
        Some(Self {
            context,
            index: caps[2].parse().ok()?,
            nanos: caps[3].parse().ok()?,
            extension: caps[4].to_string(),
        })
    }
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[(input|output|metadata)-attachment-(\d+)-(\d+)\.([a-z0-9]+)\]$")
            .expect("attachment token regex")
    })
}

/// True when the string is exactly one reference token; used to keep
/// re-stripping idempotent.
pub fn is_attachment_token(raw: &str) -> bool {
    token_regex().is_match(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let token = AttachmentToken {
            context: AttachmentContext::Input,
            index: 1,
            nanos: 1_714_000_000_123_456_789,
            extension: "png".to_string(),
        };
        let rendered = token.render();
        assert_eq!(rendered, "[input-attachment-1-1714000000123456789.png]");
        assert!(is_attachment_token(&rendered));
        assert_eq!(AttachmentToken::parse(&rendered), Some(token));
    }

    #[test]
    fn non_tokens_are_not_matched() {
        assert!(!is_attachment_token("plain text"));
        assert!(!is_attachment_token("[input-attachment-1-abc.png]"));
        assert!(!is_attachment_token("[header-attachment-1-2.png]"));
        // Token must be the whole string, not embedded in prose.
        assert!(!is_attachment_token("see [input-attachment-1-2.png] above"));
    }
}
