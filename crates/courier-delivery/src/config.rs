use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables of the delivery engine. Durations are whole seconds in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SenderConfig {
    /// Sender keys older than this are rotated before a group send.
    #[serde(with = "duration_secs")]
    pub max_sender_key_age: Duration,
    #[serde(with = "duration_secs")]
    pub invalid_signature_window: Duration,
    /// Prekey fetches for a recipient stop once this many invalid signatures
    /// were seen inside the window.
    pub invalid_signature_threshold: u32,
    #[serde(with = "duration_secs")]
    pub untrusted_identity_window: Duration,
    /// How long a relay-confirmed missing account is remembered.
    #[serde(with = "duration_secs")]
    pub nonexistent_account_ttl: Duration,
    pub sender_key_min_recipients: usize,
    #[serde(with = "duration_secs")]
    pub spam_challenge_timeout: Duration,
    /// Larger plaintexts always use fanout.
    pub max_sender_key_envelope_size: usize,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_sender_key_age: Duration::from_secs(14 * 24 * 60 * 60),
            invalid_signature_window: Duration::from_secs(5 * 60),
            invalid_signature_threshold: 2,
            untrusted_identity_window: Duration::from_secs(5 * 60),
            nonexistent_account_ttl: Duration::from_secs(6 * 60 * 60),
            sender_key_min_recipients: 2,
            spam_challenge_timeout: Duration::from_secs(10),
            max_sender_key_envelope_size: 256 * 1024,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SenderConfig {
    /// Parse a (possibly partial) JSON document over the defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
