//! Shared harness: a scripted relay backed by real peer key material, and a
//! sender wired to in-memory stores.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_crypto::sealed_sender;
use courier_crypto::signal::{
    CiphertextMessage, MemoryIdentityStore, MemoryPreKeyStore, MemorySessionStore, PreKeyBundle,
};
use courier_crypto::{AccessKey, Identity, ProtocolAddress, SenderCertificate, SignalSessionManager};
use parking_lot::Mutex;

use courier_delivery::clock::ManualClock;
use courier_delivery::relay::{
    DeviceMessage, DeviceSelector, MessageSubmission, MultiRecipientSendResponse,
    MultiRecipientSubmission, RelayAuth, RelayTransport,
};
use courier_delivery::services::{
    AttachmentUploader, NoopDeliveryHooks, PhoneNumberDirectory, SpamChallengeResolver,
    StaticAccountState, SyncTranscriptSender,
};
use courier_delivery::store::{
    MemoryMessageStore, MemoryPayloadLog, MemoryRecipientDirectory, MemorySenderKeyStore,
    MemoryThreadStore, RecipientRecord,
};
use courier_delivery::{
    Address, DeviceId, GroupThread, LocalAccount, MessageKind, MessageSender, OutgoingMessage,
    RelayError, SendError, SenderConfig, SenderServices, ServiceId, Thread, ThreadId,
};

pub const LOCAL: &str = "local-account";
pub const LOCAL_DEVICE: DeviceId = 1;

pub fn init() {
    courier_delivery::logging::init_tracing("courier_delivery=debug");
}

// ── Peers ──────────────────────────────────────────────────────────────

/// A remote account with real session state on each of its devices.
pub struct Peer {
    pub service_id: ServiceId,
    pub identity: Identity,
    pub access_key: AccessKey,
    devices: Mutex<BTreeMap<DeviceId, Arc<SignalSessionManager>>>,
}

impl Peer {
    fn new(name: &str, device_ids: &[DeviceId], access_key: AccessKey) -> Self {
        let peer = Self {
            service_id: ServiceId::new(name),
            identity: Identity::generate(),
            access_key,
            devices: Mutex::new(BTreeMap::new()),
        };
        for &device_id in device_ids {
            peer.add_device(device_id);
        }
        peer
    }

    pub fn add_device(&self, device_id: DeviceId) {
        let manager = SignalSessionManager::new(
            Box::new(MemoryIdentityStore::new(&self.identity, 1000 + device_id)),
            Box::new(MemoryPreKeyStore::new()),
            Box::new(MemorySessionStore::new()),
        );
        self.devices.lock().insert(device_id, Arc::new(manager));
    }

    pub fn remove_device(&self, device_id: DeviceId) {
        self.devices.lock().remove(&device_id);
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.lock().keys().copied().collect()
    }

    fn bundle(&self, device_id: DeviceId, prekey_id: u32) -> Option<PreKeyBundle> {
        let manager = self.devices.lock().get(&device_id).cloned()?;
        manager
            .generate_prekey_bundle(device_id, prekey_id, Some(prekey_id))
            .ok()
    }

    /// Open a sealed device message on `device_id` and decrypt it.
    pub fn open(&self, device_id: DeviceId, message: &DeviceMessage) -> Vec<u8> {
        let content = sealed_sender::open(&self.identity, &message.content).expect("unseal");
        let manager = self.devices.lock().get(&device_id).cloned().expect("device");
        manager
            .decrypt(
                &ProtocolAddress::new(LOCAL, LOCAL_DEVICE),
                &CiphertextMessage {
                    message_type: content.message_type,
                    body: content.contents,
                },
            )
            .expect("decrypt")
    }
}

// ── Relay ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Request {
    FetchPrekeys {
        recipient: ServiceId,
        devices: DeviceSelector,
        auth: RelayAuth,
    },
    Submit {
        submission: MessageSubmission,
        auth: RelayAuth,
    },
    MultiRecipient(MultiRecipientSubmission),
    CheckAccount(ServiceId),
}

/// Relay double. Answers from peer key material unless a response was
/// queued for the endpoint.
#[derive(Default)]
pub struct MockRelay {
    peers: Mutex<HashMap<ServiceId, Arc<Peer>>>,
    next_prekey_id: AtomicU32,
    prekey_failures: Mutex<HashMap<ServiceId, VecDeque<RelayError>>>,
    submit_failures: Mutex<HashMap<ServiceId, VecDeque<RelayError>>>,
    multi_responses: Mutex<VecDeque<Result<MultiRecipientSendResponse, RelayError>>>,
    missing_accounts: Mutex<HashSet<ServiceId>>,
    fetch_delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<Request>>,
}

pub fn status(status: u16, body: &str) -> RelayError {
    RelayError::Status {
        status,
        body: body.as_bytes().to_vec(),
        retry_after: None,
    }
}

impl MockRelay {
    pub fn add_peer(&self, peer: Arc<Peer>) {
        self.peers.lock().insert(peer.service_id.clone(), peer);
    }

    pub fn fail_prekeys(&self, recipient: &ServiceId, error: RelayError) {
        self.prekey_failures
            .lock()
            .entry(recipient.clone())
            .or_default()
            .push_back(error);
    }

    pub fn fail_submit(&self, recipient: &ServiceId, error: RelayError) {
        self.submit_failures
            .lock()
            .entry(recipient.clone())
            .or_default()
            .push_back(error);
    }

    pub fn queue_multi(&self, response: Result<MultiRecipientSendResponse, RelayError>) {
        self.multi_responses.lock().push_back(response);
    }

    pub fn remove_account(&self, recipient: &ServiceId) {
        self.missing_accounts.lock().insert(recipient.clone());
    }

    pub fn delay_prekey_fetches(&self, delay: Duration) {
        *self.fetch_delay.lock() = Some(delay);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn submissions(&self) -> Vec<(MessageSubmission, RelayAuth)> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::Submit { submission, auth } => Some((submission, auth)),
                _ => None,
            })
            .collect()
    }

    pub fn submissions_to(&self, recipient: &ServiceId) -> Vec<MessageSubmission> {
        self.submissions()
            .into_iter()
            .filter(|(submission, _)| submission.destination == *recipient)
            .map(|(submission, _)| submission)
            .collect()
    }

    pub fn multi_submissions(&self) -> Vec<MultiRecipientSubmission> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::MultiRecipient(submission) => Some(submission),
                _ => None,
            })
            .collect()
    }

    pub fn prekey_fetches(&self) -> Vec<(ServiceId, DeviceSelector)> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::FetchPrekeys {
                    recipient, devices, ..
                } => Some((recipient, devices)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, request: Request) {
        self.requests.lock().push(request);
    }
}

#[async_trait]
impl RelayTransport for MockRelay {
    async fn fetch_prekeys(
        &self,
        recipient: &ServiceId,
        devices: DeviceSelector,
        auth: RelayAuth,
    ) -> Result<Vec<PreKeyBundle>, RelayError> {
        self.record(Request::FetchPrekeys {
            recipient: recipient.clone(),
            devices,
            auth,
        });
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self
            .prekey_failures
            .lock()
            .get_mut(recipient)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        let Some(peer) = self.peers.lock().get(recipient).cloned() else {
            return Err(status(404, ""));
        };
        let wanted = match devices {
            DeviceSelector::All => peer.device_ids(),
            DeviceSelector::Device(device_id) => vec![device_id],
        };
        let bundles: Vec<_> = wanted
            .into_iter()
            .filter_map(|device_id| {
                let id = self.next_prekey_id.fetch_add(1, Ordering::SeqCst) + 1;
                peer.bundle(device_id, id)
            })
            .collect();
        if bundles.is_empty() {
            return Err(status(404, ""));
        }
        Ok(bundles)
    }

    async fn submit_messages(
        &self,
        submission: &MessageSubmission,
        auth: RelayAuth,
    ) -> Result<(), RelayError> {
        self.record(Request::Submit {
            submission: submission.clone(),
            auth,
        });
        match self
            .submit_failures
            .lock()
            .get_mut(&submission.destination)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn submit_multi_recipient(
        &self,
        submission: &MultiRecipientSubmission,
    ) -> Result<MultiRecipientSendResponse, RelayError> {
        self.record(Request::MultiRecipient(submission.clone()));
        self.multi_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(MultiRecipientSendResponse::default()))
    }

    async fn check_account_exists(&self, recipient: &ServiceId) -> Result<(), RelayError> {
        self.record(Request::CheckAccount(recipient.clone()));
        let known = self.peers.lock().contains_key(recipient);
        if !known || self.missing_accounts.lock().contains(recipient) {
            return Err(status(404, ""));
        }
        Ok(())
    }
}

// ── Collaborators ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct ScriptedSpamResolver {
    pub resolves: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl SpamChallengeResolver for ScriptedSpamResolver {
    async fn try_handle_silently(&self, _body: &[u8], _retry_after: Option<Duration>) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.resolves.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MapPhoneDirectory {
    pub numbers: Mutex<HashMap<String, ServiceId>>,
    pub lookups: AtomicUsize,
}

#[async_trait]
impl PhoneNumberDirectory for MapPhoneDirectory {
    async fn lookup(
        &self,
        phone_numbers: &[String],
    ) -> Result<HashMap<String, ServiceId>, SendError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let numbers = self.numbers.lock();
        Ok(phone_numbers
            .iter()
            .filter_map(|phone| numbers.get(phone).map(|sid| (phone.clone(), sid.clone())))
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingUploader {
    pub uploaded: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl AttachmentUploader for RecordingUploader {
    async fn upload(&self, attachment_id: &str) -> Result<(), SendError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SendError::AttachmentUpload(attachment_id.to_string()));
        }
        self.uploaded.lock().push(attachment_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTranscripts {
    pub sent: Mutex<Vec<u64>>,
}

#[async_trait]
impl SyncTranscriptSender for RecordingTranscripts {
    async fn send_transcript(&self, message: &OutgoingMessage) -> Result<(), SendError> {
        self.sent.lock().push(message.timestamp);
        Ok(())
    }
}

// ── Harness ────────────────────────────────────────────────────────────

pub struct Harness {
    pub sender: Arc<MessageSender>,
    pub relay: Arc<MockRelay>,
    pub sessions: Arc<SignalSessionManager>,
    pub recipients: Arc<MemoryRecipientDirectory>,
    pub threads: Arc<MemoryThreadStore>,
    pub messages: Arc<MemoryMessageStore>,
    pub sender_keys: Arc<MemorySenderKeyStore>,
    pub payloads: Arc<MemoryPayloadLog>,
    pub account: Arc<StaticAccountState>,
    pub spam: Arc<ScriptedSpamResolver>,
    pub phones: Arc<MapPhoneDirectory>,
    pub uploads: Arc<RecordingUploader>,
    pub transcripts: Arc<RecordingTranscripts>,
    pub clock: Arc<ManualClock>,
    next_access_key: AtomicU32,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SenderConfig::default())
    }

    pub fn with_config(config: SenderConfig) -> Self {
        init();
        let local_identity = Identity::generate();
        let trust_root = Identity::generate();
        let certificate = SenderCertificate::issue(
            &trust_root,
            LOCAL,
            LOCAL_DEVICE,
            local_identity.identity_key(),
            u64::MAX,
        )
        .expect("certificate");
        let sessions = Arc::new(SignalSessionManager::new(
            Box::new(MemoryIdentityStore::new(&local_identity, 4242)),
            Box::new(MemoryPreKeyStore::new()),
            Box::new(MemorySessionStore::new()),
        ));
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let relay = Arc::new(MockRelay::default());
        let recipients = Arc::new(MemoryRecipientDirectory::new());
        let threads = Arc::new(MemoryThreadStore::new());
        let messages = Arc::new(MemoryMessageStore::new());
        let sender_keys = Arc::new(MemorySenderKeyStore::new(clock.clone()));
        let payloads = Arc::new(MemoryPayloadLog::new());
        let account = Arc::new(StaticAccountState::new(
            LocalAccount {
                service_id: ServiceId::new(LOCAL),
                phone_number: Some("+15550000".into()),
                device_id: LOCAL_DEVICE,
            },
            Some(certificate),
        ));
        let spam = Arc::new(ScriptedSpamResolver::default());
        let phones = Arc::new(MapPhoneDirectory::default());
        let uploads = Arc::new(RecordingUploader::default());
        let transcripts = Arc::new(RecordingTranscripts::default());

        let services = SenderServices {
            sessions: sessions.clone(),
            relay: relay.clone(),
            recipients: recipients.clone(),
            threads: threads.clone(),
            messages: messages.clone(),
            sender_keys: sender_keys.clone(),
            payloads: payloads.clone(),
            account: account.clone(),
            spam_challenges: spam.clone(),
            phone_numbers: phones.clone(),
            attachments: uploads.clone(),
            sync_transcripts: transcripts.clone(),
            hooks: Arc::new(NoopDeliveryHooks),
            clock: clock.clone(),
        };
        Self {
            sender: Arc::new(MessageSender::new(services, config)),
            relay,
            sessions,
            recipients,
            threads,
            messages,
            sender_keys,
            payloads,
            account,
            spam,
            phones,
            uploads,
            transcripts,
            clock,
            next_access_key: AtomicU32::new(1),
        }
    }

    /// A registered peer the relay knows, with an access key on record.
    pub fn add_peer(&self, name: &str, devices: &[DeviceId]) -> Arc<Peer> {
        let key_byte = u8::try_from(self.next_access_key.fetch_add(1, Ordering::SeqCst))
            .expect("few peers");
        let peer = Arc::new(Peer::new(name, devices, AccessKey::from_bytes([key_byte; 16])));
        self.relay.add_peer(peer.clone());
        let mut record = RecipientRecord::new(peer.service_id.clone());
        record.devices = devices.iter().copied().collect();
        record.access_key = Some(peer.access_key);
        self.recipients.insert(record);
        peer
    }

    /// Process a fresh bundle for each device so sends need no prekey fetch.
    pub fn establish_sessions(&self, peer: &Peer) {
        for device_id in peer.device_ids() {
            let bundle = peer.bundle(device_id, 90_000 + device_id).expect("bundle");
            self.sessions
                .process_prekey_bundle(&peer.service_id.protocol_address(device_id), &bundle)
                .expect("session");
        }
    }

    pub fn contact_thread(&self, id: &str, contact: Address) -> ThreadId {
        let thread_id = ThreadId::new(id);
        self.threads.insert(Thread::Contact {
            id: thread_id.clone(),
            contact,
        });
        thread_id
    }

    pub fn group_thread(&self, id: &str, members: &[&Peer], uses_sender_key: bool) -> ThreadId {
        let thread_id = ThreadId::new(id);
        let mut member_set: BTreeSet<Address> = members
            .iter()
            .map(|peer| Address::Service(peer.service_id.clone()))
            .collect();
        member_set.insert(Address::service(LOCAL));
        self.threads.insert(Thread::Group(GroupThread {
            id: thread_id.clone(),
            group_id: id.as_bytes().to_vec(),
            members: member_set,
            invited: BTreeSet::new(),
            uses_sender_key,
            announcement_only: false,
            local_is_admin: false,
        }));
        thread_id
    }
}

pub fn text(timestamp: u64, thread: &ThreadId, recipients: &[&Peer]) -> OutgoingMessage {
    OutgoingMessage::new(
        timestamp,
        thread.clone(),
        MessageKind::Data {
            is_voice: false,
            is_view_once: false,
        },
        format!("hello {timestamp}"),
    )
    .with_recipients(
        recipients
            .iter()
            .map(|peer| Address::Service(peer.service_id.clone())),
    )
}

pub fn address(peer: &Peer) -> Address {
    Address::Service(peer.service_id.clone())
}
