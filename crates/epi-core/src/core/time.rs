// crates/epi-core/src/core/time.rs
// ============================================================================
// Module: EPI Time Model
// Description: Canonical UTC timestamps for manifests and step records.
// Purpose: Render timestamps with one fixed precision so signed bytes are stable.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! Every EPI timestamp is UTC with microsecond precision and renders as
//! `YYYY-MM-DDTHH:MM:SS.ffffffZ`. Values are truncated to microseconds at
//! construction so that a parsed timestamp re-serializes to the exact bytes
//! it was read from, which the canonical manifest payload depends on.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::UtcOffset;
use time::format_description::well_known::Iso8601;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// UTC timestamp with fixed microsecond precision.
///
/// # Invariants
/// - Offset is always UTC.
/// - Sub-microsecond digits are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(OffsetDateTime);

impl Timestamp {
    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    /// Normalizes an arbitrary date-time into a canonical timestamp.
    #[must_use]
    pub fn from_datetime(value: OffsetDateTime) -> Self {
        let utc = value.to_offset(UtcOffset::UTC);
        let truncated = utc.replace_nanosecond(utc.microsecond() * 1_000).unwrap_or(utc);
        Self(truncated)
    }

    /// Builds a timestamp from unix epoch microseconds.
    ///
    /// Returns `None` when the value is outside the supported range.
    #[must_use]
    pub fn from_unix_micros(micros: i64) -> Option<Self> {
        let nanos = i128::from(micros) * 1_000;
        OffsetDateTime::from_unix_timestamp_nanos(nanos).ok().map(Self)
    }

    /// Parses an RFC 3339 timestamp, or an ISO-8601 value without offset (read as UTC).
    ///
    /// Returns `None` when the text is not a recognizable timestamp.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        if let Ok(value) = OffsetDateTime::parse(text, &Rfc3339) {
            return Some(Self::from_datetime(value));
        }
        PrimitiveDateTime::parse(text, &Iso8601::DEFAULT)
            .ok()
            .map(|value| Self::from_datetime(value.assume_utc()))
    }

    /// Returns the underlying date-time.
    #[must_use]
    pub const fn as_datetime(&self) -> OffsetDateTime {
        self.0
    }

    /// Returns unix epoch milliseconds.
    #[must_use]
    pub fn unix_millis(&self) -> i128 {
        self.0.unix_timestamp_nanos() / 1_000_000
    }

    /// Renders the compact `YYYYMMDD_HHMMSS` form used in generated file names.
    #[must_use]
    pub fn file_stamp(&self) -> String {
        let value = self.0;
        format!(
            "{:04}{:02}{:02}_{:02}{:02}{:02}",
            value.year(),
            u8::from(value.month()),
            value.day(),
            value.hour(),
            value.minute(),
            value.second()
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
            value.year(),
            u8::from(value.month()),
            value.day(),
            value.hour(),
            value.minute(),
            value.second(),
            value.microsecond()
        )
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid utc timestamp: {text}")))
    }
}
