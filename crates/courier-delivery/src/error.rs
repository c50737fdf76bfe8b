use std::time::Duration;

use courier_crypto::CryptoError;
use thiserror::Error;

use crate::ids::{DeviceId, ServiceId};

/// Why a send (or one recipient of it) did not go through.
///
/// Values are cloned freely: a single failed multicast request is reported
/// once per recipient it was addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("untrusted identity for {0}")]
    UntrustedIdentity(ServiceId),

    #[error("invalid signed prekey signature for {recipient}")]
    InvalidKeySignature { recipient: ServiceId, terminal: bool },

    #[error("{0} has no account")]
    NoSuchRecipient(ServiceId),

    #[error("sealed sender credentials were rejected")]
    InvalidAuthHeader,

    #[error("multicast request named an unknown recipient")]
    InvalidRecipient,

    #[error("recipient device list changed")]
    DeviceUpdate,

    #[error("recipient sessions are stale")]
    StaleDevices,

    #[error("no session for {recipient}.{device_id}")]
    MissingSession {
        recipient: ServiceId,
        device_id: DeviceId,
    },

    #[error("identity key for {0} changed under an existing session")]
    IdentityKeyMismatch(ServiceId),

    #[error("relay endpoints disagree about whether {0} is registered")]
    AccountExistenceMismatch(ServiceId),

    #[error("no session for transient message")]
    NoSessionForTransientMessage,

    #[error("spam challenge resolved, send may be retried")]
    SpamChallengeResolved,

    #[error("spam challenge requires user action")]
    SpamChallengeRequired,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("network failure: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("relay responded {status}")]
    Relay { status: u16 },

    #[error("malformed relay response: {0}")]
    InvalidResponse(String),

    #[error("message was deleted before it was sent")]
    MessageDeletedBeforeSent,

    #[error("app build expired")]
    AppExpired,

    #[error("local account is not registered")]
    NotRegistered,

    #[error("contact is blocked")]
    BlockedContactRecipient,

    #[error("message has no valid recipients")]
    NoValidRecipients,

    #[error("thread does not accept this message")]
    ThreadNotSendable,

    #[error("thread not found")]
    ThreadMissing,

    #[error("attachment upload failed: {0}")]
    AttachmentUpload(String),

    #[error("device message type mismatch: {0}")]
    MessageTypeMismatch(String),

    #[error("{0} recovery was already used for this send")]
    RecoveryExhausted(&'static str),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Store(String),
}

/// Coarse classification used to pick the error reported for a whole send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendErrorClass {
    /// Abort the send; reported ahead of everything else.
    Fatal,
    Retryable,
    NonRetryable,
}

impl SendError {
    pub fn class(&self) -> SendErrorClass {
        if self.is_fatal() {
            SendErrorClass::Fatal
        } else if self.is_retryable() {
            SendErrorClass::Retryable
        } else {
            SendErrorClass::NonRetryable
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MessageTypeMismatch(_)
                | Self::RecoveryExhausted(_)
                | Self::AppExpired
                | Self::NotRegistered
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DeviceUpdate
            | Self::StaleDevices
            | Self::MissingSession { .. }
            | Self::IdentityKeyMismatch(_)
            | Self::AccountExistenceMismatch(_)
            | Self::SpamChallengeResolved
            | Self::RateLimited { .. }
            | Self::Network(_)
            | Self::Timeout
            | Self::AttachmentUpload(_)
            | Self::Store(_) => true,
            Self::InvalidKeySignature { terminal, .. } => !terminal,
            Self::Relay { status } => *status >= 500,
            _ => false,
        }
    }

    /// HTTP-like status the error corresponds to, when it came from the relay.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Relay { status } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::InvalidAuthHeader => Some(401),
            Self::NoSuchRecipient(_) | Self::InvalidRecipient => Some(404),
            Self::DeviceUpdate => Some(409),
            Self::StaleDevices => Some(410),
            Self::SpamChallengeResolved | Self::SpamChallengeRequired => Some(428),
            _ => None,
        }
    }

    /// Whether the caller's job queue should schedule another attempt.
    ///
    /// 508 is a relay loop-detection response and is never retried; rate
    /// limits always are.
    pub fn should_retry_send(&self) -> bool {
        (self.is_retryable() && self.http_status() != Some(508))
            || matches!(self, Self::RateLimited { .. })
    }
}

impl From<CryptoError> for SendError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::SessionNotFound(address) => Self::MissingSession {
                recipient: ServiceId::new(address.name()),
                device_id: address.device_id(),
            },
            CryptoError::UntrustedIdentity(name) => Self::UntrustedIdentity(ServiceId::new(name)),
            CryptoError::IdentityKeyMismatch(address) => {
                Self::IdentityKeyMismatch(ServiceId::new(address.name()))
            }
            CryptoError::InvalidSignature(address) => Self::InvalidKeySignature {
                recipient: ServiceId::new(address.name()),
                terminal: false,
            },
            CryptoError::StorageError(message) => Self::Store(message),
            other => Self::Crypto(other.to_string()),
        }
    }
}

/// Failure reported by the relay transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("relay responded {status}")]
    Status {
        status: u16,
        body: Vec<u8>,
        retry_after: Option<Duration>,
    },

    #[error("network failure: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,
}

impl RelayError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<RelayError> for SendError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Status {
                status: 429,
                retry_after,
                ..
            } => Self::RateLimited { retry_after },
            RelayError::Status { status, .. } => Self::Relay { status },
            RelayError::Network(message) => Self::Network(message),
            RelayError::Timeout => Self::Timeout,
        }
    }
}

/// Failure of a collaborator store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<StoreError> for SendError {
    fn from(e: StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid sender config: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}
