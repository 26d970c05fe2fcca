//! Canonical encoding of the signed portion of an audit record
//!
//! The signature covers `{action, actor_id, details, request_id,
//! timestamp}`. The encoding must be byte-identical across independent
//! implementations, so:
//! - keys are sorted at every nesting level (serde_json's default map is
//!   BTreeMap-backed, which gives this for free),
//! - the timestamp is RFC 3339 UTC with exactly microsecond precision
//!   and a `Z` suffix,
//! - absent details encode as JSON `null`.

use crate::record::AuditAction;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

/// Format a timestamp the way the canonical encoding requires
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Build the canonical byte string that gets signed
pub fn canonical_message(
    request_id: &str,
    action: AuditAction,
    actor_id: &str,
    timestamp: &DateTime<Utc>,
    details: Option<&Value>,
) -> String {
    let payload = json!({
        "action": action.as_str(),
        "actor_id": actor_id,
        "details": details.cloned().unwrap_or(Value::Null),
        "request_id": request_id,
        "timestamp": canonical_timestamp(timestamp),
    });

    // Value::Object serializes with sorted keys (BTreeMap), no
    // locale-dependent formatting anywhere.
    payload.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap()
    }

    #[test]
    fn test_exact_encoding() {
        let msg = canonical_message("REQ-ABC", AuditAction::Created, "alice", &fixed_ts(), None);

        assert_eq!(
            msg,
            r#"{"action":"created","actor_id":"alice","details":null,"request_id":"REQ-ABC","timestamp":"2024-03-01T12:30:45.000000Z"}"#
        );
    }

    #[test]
    fn test_details_keys_sorted() {
        let details = json!({"zebra": 1, "alpha": 2});
        let msg = canonical_message(
            "REQ-ABC",
            AuditAction::Executed,
            "bob",
            &fixed_ts(),
            Some(&details),
        );

        // nested keys come out sorted regardless of construction order
        assert!(msg.contains(r#""details":{"alpha":2,"zebra":1}"#));
    }

    #[test]
    fn test_deterministic() {
        let details = json!({"b": 1, "a": [1, 2, 3]});
        let ts = fixed_ts();

        let m1 = canonical_message("REQ-1", AuditAction::Approved, "bob", &ts, Some(&details));
        let m2 = canonical_message("REQ-1", AuditAction::Approved, "bob", &ts, Some(&details));
        assert_eq!(m1, m2);
    }

    #[test]
    fn test_timestamp_microsecond_precision() {
        let ts = Utc.timestamp_opt(1_709_296_245, 123_456_789).unwrap();
        assert_eq!(canonical_timestamp(&ts), "2024-03-01T12:30:45.123456Z");
    }
}
