//! The delivery engine: outer and inner send orchestration over the device
//! encryption builder, the transmission executor, and the sender-key planner.

mod device_builder;
mod eligibility;
mod executor;
mod inner;
mod outer;
mod planner;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use courier_crypto::{AccessKey, SenderCertificate, SignalSessionManager};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::config::SenderConfig;
use crate::error::{RelayError, SendError, SendErrorClass};
use crate::ids::{Address, DeviceId, LocalAccount, ServiceId};
use crate::message::{OutgoingMessage, RecipientState};
use crate::pending::PendingSends;
use crate::recent_failures::RecentFailures;
use crate::relay::{RelayAuth, RelayTransport};
use crate::services::{
    AccountState, AttachmentUploader, DeliveryHooks, PhoneNumberDirectory, SpamChallengeResolver,
    SyncTranscriptSender,
};
use crate::store::{
    MessageStore, PayloadId, PayloadLog, RecipientDirectory, SenderKeyStore, ThreadStore,
};
use crate::thread::Thread;

/// Everything the engine talks to.
pub struct SenderServices {
    pub sessions: Arc<SignalSessionManager>,
    pub relay: Arc<dyn RelayTransport>,
    pub recipients: Arc<dyn RecipientDirectory>,
    pub threads: Arc<dyn ThreadStore>,
    pub messages: Arc<dyn MessageStore>,
    pub sender_keys: Arc<dyn SenderKeyStore>,
    pub payloads: Arc<dyn PayloadLog>,
    pub account: Arc<dyn AccountState>,
    pub spam_challenges: Arc<dyn SpamChallengeResolver>,
    pub phone_numbers: Arc<dyn PhoneNumberDirectory>,
    pub attachments: Arc<dyn AttachmentUploader>,
    pub sync_transcripts: Arc<dyn SyncTranscriptSender>,
    pub hooks: Arc<dyn DeliveryHooks>,
    pub clock: Arc<dyn Clock>,
}

/// Sends outgoing messages to every device of every recipient.
pub struct MessageSender {
    services: SenderServices,
    config: SenderConfig,
    recent_failures: RecentFailures,
    pending: Arc<PendingSends>,
    /// At most one inner send per recipient is in flight.
    recipient_locks: RecipientLocks,
}

impl MessageSender {
    pub fn new(services: SenderServices, config: SenderConfig) -> Self {
        let recent_failures = RecentFailures::new(Arc::clone(&services.clock), &config);
        Self {
            services,
            config,
            recent_failures,
            pending: Arc::new(PendingSends::new()),
            recipient_locks: RecipientLocks::default(),
        }
    }

    /// Tracker of in-flight sends, for callers that must not exit mid-send.
    pub fn pending_sends(&self) -> &Arc<PendingSends> {
        &self.pending
    }

    pub fn recent_failures(&self) -> &RecentFailures {
        &self.recent_failures
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub(crate) async fn lock_recipient(&self, recipient: &ServiceId) -> RecipientGuard<'_> {
        self.recipient_locks.lock(recipient).await
    }

    /// Sealed-sender credentials for one recipient, or `None` to send
    /// identified. Sends to ourselves are always identified.
    pub(crate) fn sealed_sender_parameters(
        &self,
        send: &MessageSend,
        certificate: Option<&SenderCertificate>,
    ) -> Result<Option<SealedSenderParameters>, SendError> {
        let Some(certificate) = certificate else {
            return Ok(None);
        };
        if send.is_self_send() {
            return Ok(None);
        }
        let access_key = self
            .services
            .recipients
            .recipient(&send.recipient)?
            .and_then(|record| record.access_key);
        if access_key.is_none() && !send.message.is_story() {
            return Ok(None);
        }
        Ok(Some(SealedSenderParameters {
            certificate: certificate.clone(),
            access_key,
        }))
    }

    /// Run one relay request under the configured request timeout.
    pub(crate) async fn relay_call<T>(
        &self,
        request: impl Future<Output = Result<T, RelayError>>,
    ) -> Result<T, RelayError> {
        match tokio::time::timeout(self.config.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout),
        }
    }
}

// ── Per-message delivery state ──

/// Live recipient states of one message. Shared by every concurrent
/// recipient task of a send; persisted when the message is saved.
pub struct DeliveryTracker {
    timestamp: u64,
    persist: bool,
    states: Mutex<BTreeMap<Address, RecipientState>>,
    store: Arc<dyn MessageStore>,
}

impl DeliveryTracker {
    pub fn new(message: &OutgoingMessage, store: Arc<dyn MessageStore>) -> Self {
        Self {
            timestamp: message.timestamp,
            persist: message.should_be_saved,
            states: Mutex::new(message.recipient_states.clone()),
            store,
        }
    }

    pub fn state(&self, address: &Address) -> Option<RecipientState> {
        self.states.lock().get(address).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<Address, RecipientState> {
        self.states.lock().clone()
    }

    /// Recipients still being sent to.
    pub(crate) fn sending(&self) -> Vec<Address> {
        self.states
            .lock()
            .iter()
            .filter(|(_, state)| **state == RecipientState::Sending)
            .map(|(address, _)| address.clone())
            .collect()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.states
            .lock()
            .values()
            .filter(|state| matches!(state, RecipientState::Sent { .. }))
            .count()
    }

    pub(crate) fn set(&self, updates: Vec<(Address, RecipientState)>) -> Result<(), SendError> {
        if updates.is_empty() {
            return Ok(());
        }
        {
            let mut states = self.states.lock();
            for (address, state) in &updates {
                states.insert(address.clone(), state.clone());
            }
        }
        if self.persist {
            self.store.update_recipient_states(self.timestamp, &updates)?;
        }
        Ok(())
    }

    /// Re-key a phone-number recipient under its resolved service id.
    pub(crate) fn replace_address(&self, from: &Address, to: &Address) -> Result<(), SendError> {
        {
            let mut states = self.states.lock();
            if let Some(state) = states.remove(from) {
                states.insert(to.clone(), state);
            }
        }
        if self.persist {
            self.store.replace_recipient(self.timestamp, from, to)?;
        }
        Ok(())
    }
}

// ── Inner send inputs and results ──

/// What every recipient task of one send attempt shares.
#[derive(Clone)]
pub(crate) struct SendContext {
    pub message: Arc<OutgoingMessage>,
    pub thread: Arc<Thread>,
    pub local: LocalAccount,
    pub tracker: Arc<DeliveryTracker>,
    pub payload_id: Option<PayloadId>,
    /// Present when the message kind may go sealed and we hold a certificate.
    pub certificate: Option<SenderCertificate>,
}

impl SendContext {
    pub fn send_to(&self, recipient: ServiceId) -> MessageSend {
        MessageSend::new(
            Arc::clone(&self.message),
            Arc::clone(&self.thread),
            recipient,
            self.local.clone(),
            Arc::clone(&self.tracker),
        )
        .with_payload_id(self.payload_id)
    }
}

/// One message on its way to one recipient (all of its devices).
#[derive(Clone)]
pub struct MessageSend {
    pub message: Arc<OutgoingMessage>,
    pub thread: Arc<Thread>,
    pub recipient: ServiceId,
    pub plaintext: Bytes,
    pub payload_id: Option<PayloadId>,
    pub local: LocalAccount,
    pub tracker: Arc<DeliveryTracker>,
}

impl MessageSend {
    pub fn new(
        message: Arc<OutgoingMessage>,
        thread: Arc<Thread>,
        recipient: ServiceId,
        local: LocalAccount,
        tracker: Arc<DeliveryTracker>,
    ) -> Self {
        Self {
            plaintext: message.content.clone(),
            message,
            thread,
            recipient,
            payload_id: None,
            local,
            tracker,
        }
    }

    pub fn with_payload_id(mut self, payload_id: Option<PayloadId>) -> Self {
        self.payload_id = payload_id;
        self
    }

    pub fn is_self_send(&self) -> bool {
        self.recipient == self.local.service_id
    }
}

/// Credentials for sending without revealing the sender to the relay.
#[derive(Debug, Clone)]
pub struct SealedSenderParameters {
    pub certificate: SenderCertificate,
    /// The recipient's access key; story sends go out without one.
    pub access_key: Option<AccessKey>,
}

impl SealedSenderParameters {
    pub fn relay_auth(&self, is_story: bool) -> RelayAuth {
        match (is_story, self.access_key) {
            (true, _) => RelayAuth::Story,
            (false, Some(access_key)) => RelayAuth::Sealed(access_key),
            (false, None) => RelayAuth::Identified,
        }
    }
}

/// A device the relay accepted a message for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentDeviceMessage {
    pub device_id: DeviceId,
    pub registration_id: u32,
}

/// Per-recipient errors of a send that did not fully go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageFailure {
    pub recipient_errors: Vec<(ServiceId, SendError)>,
}

impl SendMessageFailure {
    /// The single error reported for the whole send: any fatal error, else
    /// any retryable one, else the first.
    pub fn terminal_error(&self) -> Option<&SendError> {
        self.recipient_errors
            .iter()
            .map(|(_, error)| error)
            .min_by_key(|error| error.class())
    }

    pub fn contains(&self, predicate: impl Fn(&SendError) -> bool) -> bool {
        self.recipient_errors.iter().any(|(_, error)| predicate(error))
    }

    pub fn is_fatal(&self) -> bool {
        self.terminal_error()
            .is_some_and(|error| error.class() == SendErrorClass::Fatal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    Success,
    /// The send failed before (or instead of) reaching individual recipients.
    OverallFailure(SendError),
    RecipientsFailure(SendMessageFailure),
}

impl SendResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn error(&self) -> Option<&SendError> {
        match self {
            Self::Success => None,
            Self::OverallFailure(error) => Some(error),
            Self::RecipientsFailure(failure) => failure.terminal_error(),
        }
    }
}

/// One async mutex per recipient. An entry lives only while a send holds or
/// waits for it.
#[derive(Default)]
pub(crate) struct RecipientLocks {
    locks: Mutex<HashMap<ServiceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl RecipientLocks {
    pub(crate) async fn lock(&self, recipient: &ServiceId) -> RecipientGuard<'_> {
        let mutex = Arc::clone(self.locks.lock().entry(recipient.clone()).or_default());
        let guard = Arc::clone(&mutex).lock_owned().await;
        RecipientGuard {
            locks: self,
            recipient: recipient.clone(),
            mutex,
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

pub(crate) struct RecipientGuard<'a> {
    locks: &'a RecipientLocks,
    recipient: ServiceId,
    mutex: Arc<tokio::sync::Mutex<()>>,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for RecipientGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock();
        // Held by the map, this guard and its owned lock; more means waiters.
        if Arc::strong_count(&self.mutex) == 3 {
            locks.remove(&self.recipient);
        }
    }
}
