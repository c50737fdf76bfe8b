//! Prekey bundles published by remote devices for asynchronous session setup.

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::identity::IdentityKey;

/// A one-time prekey, consumed by the first session built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub id: u32,
    pub public_key: [u8; 32],
}

/// The public keys a device publishes so others can open a session with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub device_id: u32,
    pub registration_id: u32,
    /// Account identity key shared by every device of the account.
    pub identity_key: IdentityKey,
    pub signed_prekey_id: u32,
    /// X25519 signed prekey (public).
    pub signed_prekey: [u8; 32],
    /// Signature over the signed prekey by the identity key.
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekey: Option<OneTimePreKey>,
}

impl PreKeyBundle {
    pub fn verify_signature(&self) -> Result<(), CryptoError> {
        self.identity_key
            .verify(&self.signed_prekey, &self.signed_prekey_signature)
    }
}
