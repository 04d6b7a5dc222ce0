//! Job record wire format.
//!
//! A record is stored as a flat JSON object. Sorted-set removal matches the
//! member string exactly, so the queue always carries the string it read
//! from the store rather than re-encoding a decoded record.

use crate::error::{QueueError, QueueResult};
use crate::job::JobRecord;

/// Encode a record into its stored form.
pub fn encode(record: &JobRecord) -> QueueResult<String> {
    serde_json::to_string(record).map_err(|e| QueueError::Serialization(e.to_string()))
}

/// Decode a stored record.
///
/// Key order is not significant. Anything that is not a complete record with
/// at least one allowed attempt is reported as [`QueueError::CorruptRecord`].
pub fn decode(raw: &str) -> QueueResult<JobRecord> {
    let record: JobRecord = serde_json::from_str(raw).map_err(|e| QueueError::corrupt(raw, e))?;

    if record.max_attempts == 0 {
        return Err(QueueError::corrupt(raw, "maxAttempts must be at least 1"));
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord {
            id: "42".into(),
            name: "send_email".into(),
            retry_after_seconds: 5,
            running_timeout_seconds: 30,
            max_attempts: 3,
            attempts: 0,
            target: r#"{"to":"user@example.com"}"#.into(),
        }
    }

    #[test]
    fn test_round_trip() {
        let original = record();
        let encoded = encode(&original).unwrap();
        assert_eq!(decode(&encoded).unwrap(), original);
    }

    #[test]
    fn test_round_trip_empty_fields() {
        let original = JobRecord {
            id: "x".into(),
            name: String::new(),
            retry_after_seconds: 0,
            running_timeout_seconds: 0,
            max_attempts: 1,
            attempts: 0,
            target: String::new(),
        };
        let encoded = encode(&original).unwrap();
        assert_eq!(decode(&encoded).unwrap(), original);
    }

    #[test]
    fn test_round_trip_maximal_fields() {
        let original = JobRecord {
            id: "ü-\u{1F600}-\"quoted\"\n".repeat(64),
            name: "n".repeat(4096),
            retry_after_seconds: u64::MAX,
            running_timeout_seconds: u64::MAX,
            max_attempts: u32::MAX,
            attempts: u32::MAX,
            target: "\\/\0\t".repeat(1024),
        };
        let encoded = encode(&original).unwrap();
        assert_eq!(decode(&encoded).unwrap(), original);
    }

    #[test]
    fn test_wire_field_names() {
        let encoded = encode(&record()).unwrap();
        for field in [
            "\"id\"",
            "\"name\"",
            "\"retryAfterSeconds\"",
            "\"runningTimeoutSeconds\"",
            "\"maxAttempts\"",
            "\"attempts\"",
            "\"target\"",
        ] {
            assert!(encoded.contains(field), "missing {field} in {encoded}");
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        assert_eq!(encode(&record()).unwrap(), encode(&record()).unwrap());
    }

    #[test]
    fn test_decode_any_key_order() {
        // the Redis pop script re-encodes with cjson, which does not keep order
        let raw = r#"{"target":"t","attempts":1,"maxAttempts":3,"runningTimeoutSeconds":0,"retryAfterSeconds":5,"name":"job","id":"7"}"#;
        let decoded = decode(raw).unwrap();
        assert_eq!(decoded.id, "7");
        assert_eq!(decoded.attempts, 1);
    }

    #[test]
    fn test_decode_escaped_slash() {
        let raw = r#"{"id":"1","name":"a\/b","retryAfterSeconds":1,"runningTimeoutSeconds":0,"maxAttempts":1,"attempts":0,"target":""}"#;
        assert_eq!(decode(raw).unwrap().name, "a/b");
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode("definitely not json").unwrap_err();
        assert!(err.is_corrupt_record());
    }

    #[test]
    fn test_decode_missing_field() {
        let err = decode(r#"{"id":"1","name":"job"}"#).unwrap_err();
        match err {
            QueueError::CorruptRecord { record, .. } => assert!(record.contains("\"job\"")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_zero_max_attempts() {
        let mut zero = record();
        zero.max_attempts = 0;
        let raw = serde_json::to_string(&zero).unwrap();
        assert!(decode(&raw).unwrap_err().is_corrupt_record());
    }
}
