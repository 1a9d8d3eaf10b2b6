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

//! Attachment stripping.
//!
//! Large base64 media payloads are pulled out of `input`/`output`/`metadata`
//! trees before persistence. Detection is a magic-byte probe on the decoded
//! prefix; hits are replaced in place by a reference token and the decoded
//! bytes go to the object store. Stripping an already-stripped tree is a
//! no-op, and reads can reverse the operation by fetching the bytes back.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;

use traceloom_core::attachment::{is_attachment_token, AttachmentContext, AttachmentToken};

/// (magic prefix, offset-8 tag for RIFF containers, extension, mime type)
const MEDIA_TABLE: &[(&[u8], Option<&[u8]>, &str, &str)] = &[
    (b"\x89PNG", None, "png", "image/png"),
    (b"\xFF\xD8\xFF", None, "jpg", "image/jpeg"),
    (b"GIF8", None, "gif", "image/gif"),
    (b"RIFF", Some(b"WEBP"), "webp", "image/webp"),
    (b"RIFF", Some(b"WAVE"), "wav", "audio/wav"),
    (b"BM", None, "bmp", "image/bmp"),
    (b"II*\x00", None, "tiff", "image/tiff"),
    (b"MM\x00*", None, "tiff", "image/tiff"),
    (b"%PDF", None, "pdf", "application/pdf"),
    (b"ID3", None, "mp3", "audio/mpeg"),
    (b"OggS", None, "ogg", "audio/ogg"),
];

fn detect_media(bytes: &[u8]) -> Option<(&'static str, &'static str)> {
    for (magic, tag, ext, mime) in MEDIA_TABLE {
        if bytes.starts_with(magic) {
            if let Some(tag) = tag {
                if bytes.len() < 12 || &bytes[8..12] != *tag {
                    continue;
                }
            }
            return Some((ext, mime));
        }
    }
    None
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StripError {
    #[error("a JSON string exceeds the maximum length of {0} bytes")]
    StringTooLarge(usize),
}

#[derive(Debug, Clone)]
pub struct StripperSettings {
    pub threshold_chars: usize,
    pub max_string_bytes: usize,
    pub truncate_bytes: usize,
}

impl Default for StripperSettings {
    fn default() -> Self {
        Self {
            threshold_chars: 5_000,
            max_string_bytes: 100 * 1024 * 1024,
            truncate_bytes: 10 * 1024,
        }
    }
}

/// One payload pulled out of a tree.
#[derive(Debug, Clone)]
pub struct StrippedFile {
    pub token: AttachmentToken,
    pub mime_type: String,
    pub bytes: Bytes,
}

pub struct AttachmentStripper {
    settings: StripperSettings,
}

impl AttachmentStripper {
    pub fn new(settings: StripperSettings) -> Self {
        Self { settings }
    }

    /// Walk the tree, replacing detected payloads with reference tokens.
    /// `nanos` is the tie-breaker stamped into every token of this request.
    pub fn strip(
        &self,
        context: AttachmentContext,
        tree: &mut Value,
        nanos: u64,
    ) -> Result<Vec<StrippedFile>, StripError> {
        let mut stripped = Vec::new();
        let mut seq = 0u32;
        self.walk(context, tree, nanos, &mut seq, &mut stripped)?;
        Ok(stripped)
    }

    fn walk(
        &self,
        context: AttachmentContext,
        node: &mut Value,
        nanos: u64,
        seq: &mut u32,
        out: &mut Vec<StrippedFile>,
    ) -> Result<(), StripError> {
        match node {
            Value::Object(map) => {
                for (_, child) in map.iter_mut() {
                    self.walk(context, child, nanos, seq, out)?;
                }
            }
            Value::Array(items) => {
                for child in items.iter_mut() {
                    self.walk(context, child, nanos, seq, out)?;
                }
            }
            Value::String(s) => {
                if s.len() > self.settings.max_string_bytes {
                    return Err(StripError::StringTooLarge(self.settings.max_string_bytes));
                }
                if s.len() <= self.settings.threshold_chars || is_attachment_token(s) {
                    return Ok(());
                }
                if let Some((bytes, ext, mime)) = probe_base64_media(s) {
                    *seq += 1;
                    let token = AttachmentToken {
                        context,
                        index: *seq,
                        nanos,
                        extension: ext.to_string(),
                    };
                    *node = Value::String(token.render());
                    out.push(StrippedFile {
                        token,
                        mime_type: mime.to_string(),
                        bytes: Bytes::from(bytes),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Cap a tree to the configured byte budget. The capped form is the
    /// serialized prefix wrapped back into a string value, so reference
    /// tokens beyond the budget are elided with the rest of the tail.
    pub fn truncate(&self, tree: Value) -> Value {
        let serialized = tree.to_string();
        if serialized.len() <= self.settings.truncate_bytes {
            return tree;
        }
        let mut cut = self.settings.truncate_bytes;
        while cut > 0 && !serialized.is_char_boundary(cut) {
            cut -= 1;
        }
        Value::String(serialized[..cut].to_string())
    }
}

/// Decode probe: optional data-URI prefix, then a cheap prefix decode for
/// the magic bytes, then the full decode only on a hit.
fn probe_base64_media(raw: &str) -> Option<(Vec<u8>, &'static str, &'static str)> {
    let payload = match raw.strip_prefix("data:") {
        Some(rest) => rest.split_once(";base64,").map(|(_, b64)| b64)?,
        None => raw,
    };

    let head_len = payload.len().min(60) & !3;
    if head_len < 8 {
        return None;
    }
    let head = BASE64.decode(&payload[..head_len]).ok()?;
    let (ext, mime) = detect_media(&head)?;

    let bytes = BASE64.decode(payload).ok()?;
    Some((bytes, ext, mime))
}

/// Every reference token present in a tree, in walk order.
pub fn collect_tokens(tree: &Value, out: &mut Vec<AttachmentToken>) {
    match tree {
        Value::Object(map) => {
            for child in map.values() {
                collect_tokens(child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_tokens(child, out);
            }
        }
        Value::String(s) => {
            if let Some(token) = AttachmentToken::parse(s) {
                out.push(token);
            }
        }
        _ => {}
    }
}

/// Replace tokens with the stored payloads, re-encoded as base64. Keyed by
/// the token's file name; tokens without a blob are left in place.
pub fn reinject(tree: &mut Value, blobs: &HashMap<String, Bytes>) {
    match tree {
        Value::Object(map) => {
            for (_, child) in map.iter_mut() {
                reinject(child, blobs);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                reinject(child, blobs);
            }
        }
        Value::String(s) => {
            if let Some(token) = AttachmentToken::parse(s) {
                if let Some(bytes) = blobs.get(&token.file_name()) {
                    *s = BASE64.encode(bytes);
                }
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object store i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Contract to the external blob store holding attachment bytes.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>, ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

pub fn object_key(
    workspace_id: &str,
    project_id: uuid::Uuid,
    entity_type: traceloom_core::types::EntityType,
    entity_id: uuid::Uuid,
    file_name: &str,
) -> String {
    format!("{workspace_id}/{project_id}/{entity_type}/{entity_id}/{file_name}")
}

/// Filesystem-backed implementation for single-node deployments and tests.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are built from ids and token file names, never raw user input.
        self.root.join(key)
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, ObjectStoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stripper(threshold: usize) -> AttachmentStripper {
        AttachmentStripper::new(StripperSettings {
            threshold_chars: threshold,
            max_string_bytes: 1024 * 1024,
            truncate_bytes: 64,
        })
    }

    fn png_base64(payload_len: usize) -> String {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.resize(payload_len, 0xAB);
        BASE64.encode(bytes)
    }

    #[test]
    fn strips_large_png_and_is_idempotent() {
        let stripper = stripper(100);
        let b64 = png_base64(1_000);
        let mut tree = json!({"image": b64, "note": "small"});

        let stripped = stripper
            .strip(AttachmentContext::Input, &mut tree, 42)
            .unwrap();
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped[0].mime_type, "image/png");
        assert_eq!(
            tree["image"].as_str().unwrap(),
            "[input-attachment-1-42.png]"
        );
        assert_eq!(tree["note"], "small");

        // Re-stripping the stripped tree changes nothing.
        let again = stripper
            .strip(AttachmentContext::Input, &mut tree.clone(), 43)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn data_uri_payloads_are_detected() {
        let stripper = stripper(100);
        let mut tree = json!({"img": format!("data:image/png;base64,{}", png_base64(500))});
        let stripped = stripper
            .strip(AttachmentContext::Output, &mut tree, 7)
            .unwrap();
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped[0].token.context, AttachmentContext::Output);
    }

    #[test]
    fn sequence_numbers_are_per_tree_and_one_based() {
        let stripper = stripper(100);
        let mut tree = json!({"a": png_base64(400), "b": png_base64(400)});
        let stripped = stripper
            .strip(AttachmentContext::Input, &mut tree, 9)
            .unwrap();
        let mut indexes: Vec<u32> = stripped.iter().map(|s| s.token.index).collect();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![1, 2]);
    }

    #[test]
    fn long_non_media_strings_are_left_alone() {
        let stripper = stripper(100);
        let mut tree = json!({"text": "x".repeat(1_000)});
        let stripped = stripper
            .strip(AttachmentContext::Input, &mut tree, 1)
            .unwrap();
        assert!(stripped.is_empty());
        assert_eq!(tree["text"].as_str().unwrap().len(), 1_000);
    }

    #[test]
    fn oversized_strings_are_a_deserialization_error() {
        let stripper = AttachmentStripper::new(StripperSettings {
            threshold_chars: 10,
            max_string_bytes: 100,
            truncate_bytes: 64,
        });
        let mut tree = json!({"blob": "y".repeat(200)});
        let err = stripper
            .strip(AttachmentContext::Input, &mut tree, 1)
            .unwrap_err();
        assert_eq!(err, StripError::StringTooLarge(100));
    }

    #[test]
    fn reinject_restores_the_original_base64() {
        let stripper = stripper(100);
        let original = png_base64(800);
        let mut tree = json!({"image": original.clone()});
        let stripped = stripper
            .strip(AttachmentContext::Input, &mut tree, 5)
            .unwrap();

        let mut blobs = HashMap::new();
        blobs.insert(stripped[0].token.file_name(), stripped[0].bytes.clone());
        reinject(&mut tree, &blobs);
        assert_eq!(tree["image"].as_str().unwrap(), original);
    }

    #[test]
    fn truncate_caps_the_serialized_tree() {
        let stripper = stripper(100);
        let tree = json!({"key": "v".repeat(500)});
        let capped = stripper.truncate(tree.clone());
        assert!(capped.to_string().len() <= 70 + 2);
        assert!(capped.is_string());

        let small = json!({"k": "v"});
        assert_eq!(stripper.truncate(small.clone()), small);
    }

    #[tokio::test]
    async fn fs_object_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());
        let key = "ws/p/span/e/input-attachment-1-2.png";
        store.put(key, Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(store.get(key).await.unwrap(), Some(Bytes::from_static(b"abc")));
        store.delete(key).await.unwrap();
        assert_eq!(store.get(key).await.unwrap(), None);
        // Deleting again stays quiet.
        store.delete(key).await.unwrap();
    }
}
