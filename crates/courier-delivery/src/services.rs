//! External collaborators the engine calls out to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_crypto::SenderCertificate;

use crate::error::SendError;
use crate::ids::{LocalAccount, ServiceId};
use crate::message::OutgoingMessage;
use crate::sender::SentDeviceMessage;

/// Answers a relay spam challenge without user interaction, if it can.
#[async_trait]
pub trait SpamChallengeResolver: Send + Sync {
    /// `true` when the challenge was satisfied and the send may be retried.
    async fn try_handle_silently(&self, body: &[u8], retry_after: Option<Duration>) -> bool;
}

/// Resolves phone numbers to service ids through the relay's directory.
#[async_trait]
pub trait PhoneNumberDirectory: Send + Sync {
    /// Numbers without an account are simply absent from the result.
    async fn lookup(
        &self,
        phone_numbers: &[String],
    ) -> Result<HashMap<String, ServiceId>, SendError>;
}

#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(&self, attachment_id: &str) -> Result<(), SendError>;
}

/// Tells our other devices what we sent.
#[async_trait]
pub trait SyncTranscriptSender: Send + Sync {
    async fn send_transcript(&self, message: &OutgoingMessage) -> Result<(), SendError>;
}

pub trait AccountState: Send + Sync {
    fn local_account(&self) -> Option<LocalAccount>;
    fn is_app_expired(&self) -> bool;
    fn is_registered(&self) -> bool;
    /// Certificate attached to sealed-sender envelopes.
    fn sender_certificate(&self) -> Option<SenderCertificate>;
}

pub trait DeliveryHooks: Send + Sync {
    /// A resend response reached `devices` of `recipient`.
    fn did_send_resend_response(
        &self,
        _recipient: &ServiceId,
        _timestamp: u64,
        _devices: &[SentDeviceMessage],
    ) {
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default)]
pub struct NoopDeliveryHooks;

impl DeliveryHooks for NoopDeliveryHooks {}

/// Fixed account state, with toggles for expiry and registration.
#[derive(Debug)]
pub struct StaticAccountState {
    account: LocalAccount,
    certificate: Option<SenderCertificate>,
    expired: AtomicBool,
    registered: AtomicBool,
}

impl StaticAccountState {
    pub fn new(account: LocalAccount, certificate: Option<SenderCertificate>) -> Self {
        Self {
            account,
            certificate,
            expired: AtomicBool::new(false),
            registered: AtomicBool::new(true),
        }
    }

    pub fn set_expired(&self, expired: bool) {
        self.expired.store(expired, Ordering::SeqCst);
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }
}

impl AccountState for StaticAccountState {
    fn local_account(&self) -> Option<LocalAccount> {
        self.is_registered().then(|| self.account.clone())
    }

    fn is_app_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn sender_certificate(&self) -> Option<SenderCertificate> {
        self.certificate.clone()
    }
}

/// Resolver for deployments without challenge support: always defers to
/// the user.
#[derive(Debug, Default)]
pub struct DeferSpamChallenges;

#[async_trait]
impl SpamChallengeResolver for DeferSpamChallenges {
    async fn try_handle_silently(&self, _body: &[u8], _retry_after: Option<Duration>) -> bool {
        false
    }
}
