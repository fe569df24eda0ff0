use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use ulid::Ulid;

/// Returns current unix epoch milliseconds.
///
/// A clock set before the epoch reads as `0` rather than panicking.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generates a new ULID.
pub fn new_ulid() -> Ulid {
    Ulid::new()
}

/// Generates a UI refinement session id (uuid v4, hyphenated).
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Formats epoch milliseconds as an RFC 3339 UTC timestamp.
pub fn rfc3339_from_ms(ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|t| t.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch_millis() {
        assert_eq!(
            rfc3339_from_ms(0).as_deref(),
            Some("1970-01-01T00:00:00+00:00")
        );
        assert_eq!(
            rfc3339_from_ms(1_700_000_000_123).as_deref(),
            Some("2023-11-14T22:13:20.123+00:00")
        );
    }

    #[test]
    fn session_ids_are_uuids() {
        let id = new_session_id();
        assert_eq!(id.len(), 36);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }
}
