//! The on-host slot payload: empty, or `"<prid>@<timestamp>"`.
//!
//! Parsing never validates; validation is a separate query, mirroring the
//! two-phase `from_string` / `is_valid` split of the system this subsystem
//! codifies (spec §4.1, §8 item 1-2).

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::PrimitiveDateTime;

const ISO8601_WITH_SUBSECOND: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:1+]");
const ISO8601_WITHOUT_SUBSECOND: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const ISO8601_WRITE: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]");

fn parse_iso8601(s: &str) -> Option<PrimitiveDateTime> {
    PrimitiveDateTime::parse(s, ISO8601_WITH_SUBSECOND)
        .or_else(|_| PrimitiveDateTime::parse(s, ISO8601_WITHOUT_SUBSECOND))
        .ok()
}

/// Current UTC time formatted as a microsecond-precision ISO-8601 string.
pub fn now_utc_iso8601() -> String {
    let now = time::OffsetDateTime::now_utc();
    let naive = PrimitiveDateTime::new(now.date(), now.time());
    naive
        .format(ISO8601_WRITE)
        .expect("static format description is always well-formed")
}

/// The payload stored in a slot file.
///
/// `prid` and `timestamp` are both `None` for the empty (free) slot. Once a
/// slot carries any content, parsing always produces `Some` for both
/// fields, even when the content doesn't round-trip through an `@` (e.g.
/// corrupted content has `prid = Some(whole string)`, `timestamp = Some("")`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotData {
    pub prid: Option<String>,
    pub timestamp: Option<String>,
}

impl SlotData {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(prid: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            prid: Some(prid.into()),
            timestamp: Some(timestamp.into()),
        }
    }

    /// Parse the raw slot-file content. No validation is performed here.
    pub fn parse(s: &str) -> Self {
        if s.is_empty() {
            return Self::empty();
        }
        // Mirrors splitting on every `@` and rejoining everything after the
        // first piece *without* a separator (not `splitn(2, ..)`): a payload
        // with more than one `@` loses those separators in the timestamp.
        let mut parts = s.split('@');
        let prid = parts.next().unwrap_or_default().to_string();
        let timestamp: String = parts.collect();
        Self {
            prid: Some(prid),
            timestamp: Some(timestamp),
        }
    }

    fn is_falsy(value: &Option<String>) -> bool {
        value.as_deref().is_none_or(str::is_empty)
    }

    pub fn is_empty(&self) -> bool {
        Self::is_falsy(&self.prid) && Self::is_falsy(&self.timestamp)
    }

    /// Empty is always valid. Otherwise `prid` must be a non-empty string
    /// without `@`, and `timestamp` must parse as ISO-8601.
    pub fn is_valid(&self) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(prid) = self.prid.as_deref().filter(|p| !p.is_empty()) else {
            return false;
        };
        if prid.contains('@') {
            return false;
        }
        self.timestamp
            .as_deref()
            .is_some_and(|ts| parse_iso8601(ts).is_some())
    }

    pub fn serialize(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!(
            "{}@{}",
            self.prid.as_deref().unwrap_or_default(),
            self.timestamp.as_deref().unwrap_or_default()
        )
    }

    pub fn datetime(&self) -> Option<PrimitiveDateTime> {
        self.timestamp.as_deref().and_then(parse_iso8601)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_round_trips() {
        let data = SlotData::parse("");
        assert!(data.is_empty());
        assert!(data.is_valid());
        assert_eq!(data.serialize(), "");
    }

    #[test]
    fn valid_payload_round_trips() {
        let original = SlotData::new("pr123", "2022-02-15T10:12:13.780426");
        let serialized = original.serialize();
        assert_eq!(serialized, "pr123@2022-02-15T10:12:13.780426");
        let parsed = SlotData::parse(&serialized);
        assert_eq!(parsed, original);
        assert!(parsed.is_valid());
    }

    #[test]
    fn prid_containing_at_is_invalid() {
        let data = SlotData::new("pr@123", "2022-02-15T10:12:13.780426");
        assert!(!data.is_valid());
    }

    #[test]
    fn unparseable_timestamp_is_invalid() {
        let data = SlotData::parse("invalid_slot_content");
        assert!(!data.is_empty());
        assert!(!data.is_valid());
    }

    #[test]
    fn multiple_at_signs_join_into_timestamp_without_separator() {
        let data = SlotData::parse("pr123@2022@extra");
        assert_eq!(data.prid.as_deref(), Some("pr123"));
        assert_eq!(data.timestamp.as_deref(), Some("2022extra"));
        assert!(!data.is_valid());
    }

    #[test]
    fn now_is_formatted_with_microseconds_and_reparses() {
        let ts = now_utc_iso8601();
        let data = SlotData::new("pr1", ts.clone());
        assert!(data.is_valid());
        assert!(parse_iso8601(&ts).is_some());
    }
}
