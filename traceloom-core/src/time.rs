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

//! Wire timestamps.
//!
//! Timestamps are RFC 3339 and must carry an explicit `Z`; anything else is
//! a deserialization error. Stored values are nanoseconds since the epoch.

use chrono::{DateTime, SecondsFormat, Utc};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("timestamp '{0}' must end with 'Z'")]
    MissingZone(String),
    #[error("timestamp '{0}' is not a valid RFC 3339 instant")]
    Unparseable(String),
}

/// Parse an RFC 3339 instant, requiring the trailing `Z`.
pub fn parse_rfc3339_utc(raw: &str) -> Result<DateTime<Utc>, TimeError> {
    if !raw.ends_with('Z') {
        return Err(TimeError::MissingZone(raw.to_string()));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TimeError::Unparseable(raw.to_string()))
}

/// Render with microsecond precision and a `Z` suffix.
pub fn to_rfc3339_micros(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Nanoseconds since the epoch; saturates past 2262 rather than panicking.
pub fn to_nanos(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

pub fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

/// Duration in milliseconds with sub-millisecond decimal, or `None` when the
/// span is still open.
pub fn duration_millis(start: &DateTime<Utc>, end: Option<&DateTime<Utc>>) -> Option<f64> {
    let end = end?;
    let micros = (*end - *start).num_microseconds()?;
    Some(micros as f64 / 1_000.0)
}

/// Serde adapter for mandatory timestamps.
pub mod rfc3339 {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&to_rfc3339_micros(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_rfc3339_utc(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional timestamps.
pub mod rfc3339_opt {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match dt {
            Some(dt) => s.serialize_some(&to_rfc3339_micros(dt)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw {
            Some(raw) => parse_rfc3339_utc(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_utc_with_z() {
        let dt = parse_rfc3339_utc("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(to_nanos(&dt), 1_704_067_200_000_000_000);
    }

    #[test]
    fn rejects_missing_zone() {
        assert_eq!(
            parse_rfc3339_utc("2024-01-01T00:00:00"),
            Err(TimeError::MissingZone("2024-01-01T00:00:00".into()))
        );
        // An explicit numeric offset is not the canonical form either.
        assert!(parse_rfc3339_utc("2024-01-01T00:00:00+00:00").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            parse_rfc3339_utc("not-a-timestampZ"),
            Err(TimeError::Unparseable("not-a-timestampZ".into()))
        );
    }

    #[test]
    fn duration_keeps_sub_millisecond_decimal() {
        let start = parse_rfc3339_utc("2024-01-01T00:00:00Z").unwrap();
        let end = parse_rfc3339_utc("2024-01-01T00:00:01.000500Z").unwrap();
        assert_eq!(duration_millis(&start, Some(&end)), Some(1000.5));
        assert_eq!(duration_millis(&start, None), None);
    }

    #[test]
    fn nanos_roundtrip() {
        let dt = parse_rfc3339_utc("2024-06-15T12:34:56.789012Z").unwrap();
        assert_eq!(from_nanos(to_nanos(&dt)), dt);
    }
}
