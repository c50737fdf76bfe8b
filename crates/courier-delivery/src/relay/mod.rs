//! The relay service, seen as a request/response interface.

pub mod wire;

use async_trait::async_trait;
use courier_crypto::signal::PreKeyBundle;
use courier_crypto::AccessKey;

use crate::error::RelayError;
use crate::ids::{DeviceId, ServiceId};

pub use wire::{
    AccountMismatchedDevices, AccountStaleDevices, DeviceMessage, DeviceMessageType,
    MessageSubmission, MismatchedDevices, MultiRecipientSendResponse, MultiRecipientSubmission,
    StaleDevices,
};

/// Which devices a prekey fetch asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSelector {
    All,
    Device(DeviceId),
}

/// How a request is authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAuth {
    /// Our own account credentials.
    Identified,
    /// The recipient's sealed-sender access key.
    Sealed(AccessKey),
    /// Story sends need no credential.
    Story,
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn fetch_prekeys(
        &self,
        recipient: &ServiceId,
        devices: DeviceSelector,
        auth: RelayAuth,
    ) -> Result<Vec<PreKeyBundle>, RelayError>;

    async fn submit_messages(
        &self,
        submission: &MessageSubmission,
        auth: RelayAuth,
    ) -> Result<(), RelayError>;

    async fn submit_multi_recipient(
        &self,
        submission: &MultiRecipientSubmission,
    ) -> Result<MultiRecipientSendResponse, RelayError>;

    /// `Ok` when the account exists; a 404 status when it does not.
    async fn check_account_exists(&self, recipient: &ServiceId) -> Result<(), RelayError>;
}
