//! Core data types: settings document and ban record

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SessionError};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The control plane's exported settings document.
///
/// Fetched from `{baseUrl}/statefull.json` and immutable once fetched;
/// refetched only when the control-plane URL changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    /// Canonical external URL of the control plane
    pub external_url: String,
    /// Prefix put in front of the session token on requests
    pub jwt_request_prefix: String,
    /// Header carrying the session token on requests
    pub jwt_request_header: String,
    /// Prefix the server puts in front of rotated tokens and init payloads
    pub jwt_response_prefix: String,
    /// Header carrying the rotated session token on responses
    pub jwt_response_header: String,
    /// Hash algorithm used for node assignment
    pub node_hash_algorithm: String,
    /// Hash iteration count used for node assignment
    pub node_hash_iterations: u32,
}

impl SessionSettings {
    /// Validate a settings document field by field.
    ///
    /// Fails with [`SessionError::SettingsSchema`] naming the first field
    /// that is missing or has the wrong type.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or(SessionError::SettingsSchema { field: "<root>" })?;

        fn string_field(
            object: &serde_json::Map<String, Value>,
            field: &'static str,
        ) -> Result<String> {
            object
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(SessionError::SettingsSchema { field })
        }

        Ok(Self {
            external_url: string_field(object, "externalUrl")?,
            jwt_request_prefix: string_field(object, "jwtRequestPrefix")?,
            jwt_request_header: string_field(object, "jwtRequestHeader")?,
            jwt_response_prefix: string_field(object, "jwtResponsePrefix")?,
            jwt_response_header: string_field(object, "jwtResponseHeader")?,
            node_hash_algorithm: string_field(object, "nodeHashAlgorithm")?,
            node_hash_iterations: object
                .get("nodeHashIterations")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or(SessionError::SettingsSchema {
                    field: "nodeHashIterations",
                })?,
        })
    }
}

/// A persisted ban: cooldown end time and the server's stated reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    /// Millisecond timestamp the ban ends at, or [`BanRecord::PERMANENT`]
    pub end_time: i64,
    /// Free-text reason from the close frame
    pub reason: String,
}

fn trim_tag_chars(value: &str) -> &str {
    value.trim_matches(|c: char| c == ':' || c == ' ' || c == '\n')
}

impl BanRecord {
    /// End time marking a permanent ban.
    pub const PERMANENT: i64 = -1;

    pub fn is_permanent(&self) -> bool {
        self.end_time == Self::PERMANENT
    }

    /// Parse a BAN close reason into a record.
    ///
    /// The wire format is `"<SYMBOLIC_ID>: <durationMs>[: <freeText>]"`. The
    /// leading symbolic tag and surrounding `:`/space/newline are stripped,
    /// the first remaining `:`-field is the duration in milliseconds, and
    /// the rest is the free-text reason. A non-numeric duration or one below
    /// `-1` normalizes to permanent.
    pub fn from_close_reason(raw_reason: &str, now_ms: i64) -> Self {
        let mut rest = raw_reason;
        for tag in ["STATEFULL_BAN", "BAN"] {
            if let Some(stripped) = rest.strip_prefix(tag) {
                rest = stripped;
                break;
            }
        }
        let rest = trim_tag_chars(rest);

        let mut fields = rest.splitn(2, ':');
        let duration_field = fields.next().unwrap_or("").trim();
        let reason = trim_tag_chars(fields.next().unwrap_or("")).to_string();

        let duration = duration_field
            .parse::<i64>()
            .ok()
            .filter(|d| *d >= Self::PERMANENT)
            .unwrap_or(Self::PERMANENT);

        let end_time = if duration == Self::PERMANENT {
            Self::PERMANENT
        } else {
            now_ms + duration
        };

        Self { end_time, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings_value() -> Value {
        json!({
            "externalUrl": "http://api.example:8080",
            "jwtRequestPrefix": "Bearer ",
            "jwtRequestHeader": "Authorization",
            "jwtResponsePrefix": "Bearer ",
            "jwtResponseHeader": "X-Statefull-Session",
            "nodeHashAlgorithm": "sha256",
            "nodeHashIterations": 1000,
        })
    }

    #[test]
    fn settings_parse_valid_document() {
        let settings = SessionSettings::from_value(&settings_value()).unwrap();
        assert_eq!(settings.external_url, "http://api.example:8080");
        assert_eq!(settings.node_hash_iterations, 1000);
    }

    #[test]
    fn settings_reject_wrong_types_naming_the_field() {
        let mut value = settings_value();
        value["externalUrl"] = json!(42);
        match SessionSettings::from_value(&value) {
            Err(SessionError::SettingsSchema { field }) => assert_eq!(field, "externalUrl"),
            other => panic!("expected schema error, got {:?}", other),
        }

        let mut value = settings_value();
        value["nodeHashIterations"] = json!("many");
        match SessionSettings::from_value(&value) {
            Err(SessionError::SettingsSchema { field }) => {
                assert_eq!(field, "nodeHashIterations")
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn settings_reject_iteration_count_beyond_u32() {
        let mut value = settings_value();
        value["nodeHashIterations"] = json!(u64::from(u32::MAX) + 1);
        match SessionSettings::from_value(&value) {
            Err(SessionError::SettingsSchema { field }) => {
                assert_eq!(field, "nodeHashIterations")
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn settings_reject_missing_field() {
        let mut value = settings_value();
        value.as_object_mut().unwrap().remove("jwtResponseHeader");
        match SessionSettings::from_value(&value) {
            Err(SessionError::SettingsSchema { field }) => {
                assert_eq!(field, "jwtResponseHeader")
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn settings_reject_non_object_root() {
        match SessionSettings::from_value(&json!([1, 2])) {
            Err(SessionError::SettingsSchema { field }) => assert_eq!(field, "<root>"),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn ban_reason_with_duration_and_text() {
        let record = BanRecord::from_close_reason("STATEFULL_BAN: 5000: too many requests", 1_000);
        assert_eq!(record.end_time, 6_000);
        assert_eq!(record.reason, "too many requests");
    }

    #[test]
    fn ban_reason_short_tag_form() {
        let record = BanRecord::from_close_reason("BAN: 5000: too many requests", 0);
        assert_eq!(record.end_time, 5_000);
        assert_eq!(record.reason, "too many requests");
    }

    #[test]
    fn ban_duration_non_numeric_normalizes_to_permanent() {
        let record = BanRecord::from_close_reason("STATEFULL_BAN: abc", 1_000);
        assert_eq!(record.end_time, BanRecord::PERMANENT);
        assert!(record.is_permanent());
    }

    #[test]
    fn ban_duration_below_minus_one_normalizes_to_permanent() {
        let record = BanRecord::from_close_reason("STATEFULL_BAN: -5: gone", 1_000);
        assert_eq!(record.end_time, BanRecord::PERMANENT);
        assert_eq!(record.reason, "gone");
    }

    #[test]
    fn ban_duration_minus_one_is_permanent_without_clock() {
        let record = BanRecord::from_close_reason("STATEFULL_BAN: -1", i64::MAX);
        assert!(record.is_permanent());
    }

    #[test]
    fn ban_reason_trims_surrounding_noise() {
        let record = BanRecord::from_close_reason("STATEFULL_BAN:\n 250 \n", 0);
        assert_eq!(record.end_time, 250);
        assert_eq!(record.reason, "");
    }
}
