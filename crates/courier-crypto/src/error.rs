use thiserror::Error;

use crate::address::ProtocolAddress;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("verification failed: {0}")]
    VerificationError(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("malformed message: {0}")]
    InvalidMessage(String),

    #[error("no session for {0}")]
    SessionNotFound(ProtocolAddress),

    #[error("untrusted identity for {0}")]
    UntrustedIdentity(String),

    #[error("identity key for {0} changed since the session was established")]
    IdentityKeyMismatch(ProtocolAddress),

    #[error("invalid signed prekey signature from {0}")]
    InvalidSignature(ProtocolAddress),

    #[error("registration id {registration_id} of {address} does not fit a multi-recipient message")]
    InvalidRegistrationId {
        address: ProtocolAddress,
        registration_id: u32,
    },

    #[error("key storage error: {0}")]
    StorageError(String),
}
