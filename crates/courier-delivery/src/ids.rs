use std::fmt;

use courier_crypto::ProtocolAddress;
use serde::{Deserialize, Serialize};

/// Device number within an account. The primary device is always 1.
pub type DeviceId = u32;

pub const PRIMARY_DEVICE_ID: DeviceId = 1;

/// Stable account identifier assigned by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Session address of one of this account's devices.
    pub fn protocol_address(&self, device_id: DeviceId) -> ProtocolAddress {
        ProtocolAddress::new(self.0.clone(), device_id)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a message addresses a recipient. Phone-only addresses must be
/// resolved to a [`ServiceId`] before anything can be encrypted for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Address {
    Service(ServiceId),
    Phone(String),
}

impl Address {
    pub fn service(id: impl Into<String>) -> Self {
        Self::Service(ServiceId::new(id))
    }

    pub fn service_id(&self) -> Option<&ServiceId> {
        match self {
            Self::Service(service_id) => Some(service_id),
            Self::Phone(_) => None,
        }
    }
}

impl From<ServiceId> for Address {
    fn from(service_id: ServiceId) -> Self {
        Self::Service(service_id)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service(service_id) => write!(f, "{service_id}"),
            Self::Phone(phone) => write!(f, "phone:{phone}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The registered account this device belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAccount {
    pub service_id: ServiceId,
    pub phone_number: Option<String>,
    pub device_id: DeviceId,
}

impl LocalAccount {
    pub fn is_local(&self, address: &Address) -> bool {
        match address {
            Address::Service(service_id) => *service_id == self.service_id,
            Address::Phone(phone) => self.phone_number.as_deref() == Some(phone.as_str()),
        }
    }

    pub fn address(&self) -> Address {
        Address::Service(self.service_id.clone())
    }
}
