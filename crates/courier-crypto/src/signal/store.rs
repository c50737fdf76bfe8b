use crate::address::ProtocolAddress;
use crate::error::CryptoError;
use crate::identity::{Identity, IdentityKey};
use crate::signal::session::SessionRecord;

/// Which way a message is flowing when an identity's trust is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// Result of saving a remote identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityChange {
    NewOrUnchanged,
    ReplacedExisting,
}

/// Storage trait for identity keys.
///
/// Remote identities are pinned per account (the address name), not per device.
pub trait IdentityKeyStore: Send + Sync {
    /// Our own identity.
    fn identity_key_pair(&self) -> Result<Identity, CryptoError>;

    /// Get our local registration ID.
    fn local_registration_id(&self) -> Result<u32, CryptoError>;

    /// Check if a remote identity key may be used in the given direction.
    fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
        direction: Direction,
    ) -> Result<bool, CryptoError>;

    /// Pin a remote identity key (Trust On First Use).
    fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
    ) -> Result<IdentityChange, CryptoError>;

    /// The identity currently pinned for the address's account, if any.
    fn get_identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>, CryptoError>;
}

/// Storage trait for our own prekeys.
///
/// One-time prekeys are consumed after first use.
pub trait PreKeyStore: Send + Sync {
    /// Load a prekey by ID.
    fn load_prekey(&self, prekey_id: u32) -> Result<Option<[u8; 32]>, CryptoError>;

    /// Store a prekey.
    fn store_prekey(&self, prekey_id: u32, secret: &[u8; 32]) -> Result<(), CryptoError>;

    /// Remove a consumed prekey.
    fn remove_prekey(&self, prekey_id: u32) -> Result<(), CryptoError>;

    /// Load a signed prekey.
    fn load_signed_prekey(&self, signed_prekey_id: u32) -> Result<Option<[u8; 32]>, CryptoError>;

    /// Store a signed prekey.
    fn store_signed_prekey(&self, signed_prekey_id: u32, secret: &[u8; 32])
        -> Result<(), CryptoError>;
}

/// Storage trait for pairwise sessions.
///
/// Each device address has at most one current session plus a bounded list of
/// archived ones.
pub trait SessionStore: Send + Sync {
    fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>, CryptoError>;

    fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), CryptoError>;
}
