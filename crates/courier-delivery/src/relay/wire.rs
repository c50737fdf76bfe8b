//! JSON shapes exchanged with the relay.

use courier_crypto::AccessKey;
use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, ServiceId};

/// Envelope type of a per-device message, as numbered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DeviceMessageType {
    Ciphertext,
    PrekeyBundle,
    UnidentifiedSender,
    PlaintextContent,
}

impl From<DeviceMessageType> for u8 {
    fn from(value: DeviceMessageType) -> Self {
        match value {
            DeviceMessageType::Ciphertext => 1,
            DeviceMessageType::PrekeyBundle => 3,
            DeviceMessageType::UnidentifiedSender => 6,
            DeviceMessageType::PlaintextContent => 8,
        }
    }
}

impl TryFrom<u8> for DeviceMessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ciphertext),
            3 => Ok(Self::PrekeyBundle),
            6 => Ok(Self::UnidentifiedSender),
            8 => Ok(Self::PlaintextContent),
            other => Err(format!("unknown device message type {other}")),
        }
    }
}

/// Ciphertext for one destination device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMessage {
    #[serde(rename = "type")]
    pub message_type: DeviceMessageType,
    pub destination_device_id: DeviceId,
    pub destination_registration_id: u32,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

/// All device messages for one recipient. Always one request, so the relay
/// can check the batch against the account's full device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSubmission {
    pub destination: ServiceId,
    pub messages: Vec<DeviceMessage>,
    pub timestamp: u64,
    pub online: bool,
    pub urgent: bool,
    pub story: bool,
}

/// One sealed multi-recipient payload for every sender-key recipient.
#[derive(Debug, Clone)]
pub struct MultiRecipientSubmission {
    pub payload: Vec<u8>,
    /// Combined access key; absent for story sends.
    pub access_key: Option<AccessKey>,
    pub timestamp: u64,
    pub online: bool,
    pub urgent: bool,
    pub story: bool,
}

/// 409 body of a single-recipient submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MismatchedDevices {
    pub missing_devices: Vec<DeviceId>,
    pub extra_devices: Vec<DeviceId>,
}

/// 410 body of a single-recipient submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaleDevices {
    pub stale_devices: Vec<DeviceId>,
}

/// One element of a multi-recipient 409 body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMismatchedDevices {
    pub uuid: ServiceId,
    pub devices: MismatchedDevices,
}

/// One element of a multi-recipient 410 body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStaleDevices {
    pub uuid: ServiceId,
    pub devices: StaleDevices,
}

/// 2xx body of a multi-recipient submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiRecipientSendResponse {
    /// Recipients the relay has no account for.
    #[serde(rename = "uuids404")]
    pub unregistered: Vec<ServiceId>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
