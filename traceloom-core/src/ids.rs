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

//! Version-7 UUID handling.
//!
//! Entity ids are time-ordered UUIDs: the top 48 bits carry milliseconds
//! since the Unix epoch, which makes `id DESC` a creation-time ordering and
//! lets streaming cursors stay monotonic.

use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Entity id '{0}' is not a version-7 UUID")]
    NotVersion7(Uuid),
}

/// Reject ids that are not version-7 UUIDs.
pub fn require_v7(id: &Uuid) -> Result<(), IdError> {
    if id.get_version_num() == 7 {
        Ok(())
    } else {
        Err(IdError::NotVersion7(*id))
    }
}

/// Milliseconds since the Unix epoch embedded in a v7 id.
pub fn v7_timestamp_ms(id: &Uuid) -> u64 {
    ((id.as_u128() >> 80) & 0xFFFF_FFFF_FFFF) as u64
}

/// Build a v7 UUID from an explicit millisecond timestamp and 10 bytes of
/// caller-supplied entropy. Used for deterministic derivation, where the
/// entropy is a digest rather than randomness.
pub fn v7_from_parts(unix_ts_ms: u64, entropy: &[u8; 10]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0..6].copy_from_slice(&unix_ts_ms.to_be_bytes()[2..8]);
    bytes[6..16].copy_from_slice(entropy);
    // version 7, RFC 4122 variant
    bytes[6] = (bytes[6] & 0x0F) | 0x70;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Freshly generated v7 id for server-assigned identities.
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v7_roundtrips_timestamp() {
        let id = v7_from_parts(1_700_000_000_000, &[0xAB; 10]);
        assert_eq!(id.get_version_num(), 7);
        assert_eq!(v7_timestamp_ms(&id), 1_700_000_000_000);
        assert!(require_v7(&id).is_ok());
    }

    #[test]
    fn v7_is_deterministic_for_same_parts() {
        let a = v7_from_parts(42, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let b = v7_from_parts(42, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(a, b);
    }

    #[test]
    fn v7_orders_by_timestamp() {
        let older = v7_from_parts(1_000, &[0xFF; 10]);
        let newer = v7_from_parts(2_000, &[0x00; 10]);
        assert!(newer > older);
    }

    #[test]
    fn v4_is_rejected() {
        // A v4-shaped id built by hand: version nibble 4, RFC 4122 variant.
        let mut bytes = [0x5Au8; 16];
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        let v4 = Uuid::from_bytes(bytes);
        assert_eq!(v4.get_version_num(), 4);
        assert_eq!(require_v7(&v4), Err(IdError::NotVersion7(v4)));
    }

    #[test]
    fn now_v7_is_version_7() {
        assert!(require_v7(&new_v7()).is_ok());
    }
}
