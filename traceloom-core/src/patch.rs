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

//! Three-state patch fields.
//!
//! Partial updates must distinguish "field not present" (leave the stored
//! value alone) from "field explicitly null" (clear the stored value). A
//! plain `Option` collapses the two, so patch payloads use this tri-state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Patch<T> {
    /// Key absent from the payload.
    #[default]
    Absent,
    /// Key present with an explicit `null`.
    Null,
    /// Key present with a value.
    Set(T),
}

impl<T> Patch<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Patch::Absent)
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            Patch::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_set(self) -> Option<T> {
        match self {
            Patch::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Patch<U> {
        match self {
            Patch::Absent => Patch::Absent,
            Patch::Null => Patch::Null,
            Patch::Set(v) => Patch::Set(f(v)),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(d)? {
            Some(v) => Patch::Set(v),
            None => Patch::Null,
        })
    }
}

/// Deserializer for patchable timestamps that still enforces the `Z` rule.
pub fn datetime_strict<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Patch<DateTime<Utc>>, D::Error> {
    Ok(match Option::<String>::deserialize(d)? {
        Some(raw) => Patch::Set(
            crate::time::parse_rfc3339_utc(&raw).map_err(serde::de::Error::custom)?,
        ),
        None => Patch::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Payload {
        #[serde(default)]
        tags: Patch<Vec<String>>,
    }

    #[test]
    fn absent_null_and_set_are_distinct() {
        let absent: Payload = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.tags, Patch::Absent);

        let null: Payload = serde_json::from_str(r#"{"tags": null}"#).unwrap();
        assert_eq!(null.tags, Patch::Null);

        let set: Payload = serde_json::from_str(r#"{"tags": ["a"]}"#).unwrap();
        assert_eq!(set.tags, Patch::Set(vec!["a".to_string()]));
    }
}
