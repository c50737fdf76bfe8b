//! In-memory collaborator stores. Each call takes one lock, so each call is
//! atomic with respect to every other call on the same store.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::ids::{Address, DeviceId, ServiceId, ThreadId, PRIMARY_DEVICE_ID};
use crate::message::RecipientState;
use crate::store::{
    content_hash, MessageStore, PayloadId, PayloadLog, RecipientDirectory, RecipientRecord,
    ThreadStore,
};
use crate::thread::Thread;

// ── Recipients ──

#[derive(Default)]
struct DirectoryState {
    records: HashMap<ServiceId, RecipientRecord>,
    phones: HashMap<String, ServiceId>,
    blocked: HashSet<Address>,
    profile_shared: HashSet<ServiceId>,
}

#[derive(Default)]
pub struct MemoryRecipientDirectory {
    state: Mutex<DirectoryState>,
}

impl MemoryRecipientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record, linking its phone number.
    pub fn insert(&self, record: RecipientRecord) {
        let mut state = self.state.lock();
        if let Some(phone) = &record.phone_number {
            state.phones.insert(phone.clone(), record.service_id.clone());
        }
        state.records.insert(record.service_id.clone(), record);
    }

    pub fn block(&self, address: Address) {
        self.state.lock().blocked.insert(address);
    }

    pub fn has_shared_profile(&self, service_id: &ServiceId) -> bool {
        self.state.lock().profile_shared.contains(service_id)
    }
}

impl RecipientDirectory for MemoryRecipientDirectory {
    fn service_id_for_phone(&self, phone_number: &str) -> Result<Option<ServiceId>, StoreError> {
        Ok(self.state.lock().phones.get(phone_number).cloned())
    }

    fn link_phone_number(
        &self,
        phone_number: &str,
        service_id: &ServiceId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state
            .phones
            .insert(phone_number.to_string(), service_id.clone());
        state
            .records
            .entry(service_id.clone())
            .or_insert_with(|| RecipientRecord::new(service_id.clone()))
            .phone_number = Some(phone_number.to_string());
        Ok(())
    }

    fn is_blocked(&self, address: &Address) -> Result<bool, StoreError> {
        let state = self.state.lock();
        if state.blocked.contains(address) {
            return Ok(true);
        }
        // A block on either form of the address applies to both.
        let alias = match address {
            Address::Service(service_id) => state
                .records
                .get(service_id)
                .and_then(|record| record.phone_number.clone())
                .map(Address::Phone),
            Address::Phone(phone) => state.phones.get(phone).cloned().map(Address::Service),
        };
        Ok(alias.is_some_and(|alias| state.blocked.contains(&alias)))
    }

    fn recipient(&self, service_id: &ServiceId) -> Result<Option<RecipientRecord>, StoreError> {
        Ok(self.state.lock().records.get(service_id).cloned())
    }

    fn update_devices(
        &self,
        service_id: &ServiceId,
        add: &[DeviceId],
        remove: &[DeviceId],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let record = state
            .records
            .entry(service_id.clone())
            .or_insert_with(|| RecipientRecord::new(service_id.clone()));
        record.devices.extend(add.iter().copied());
        for device in remove {
            record.devices.remove(device);
        }
        Ok(())
    }

    fn mark_registered(&self, service_id: &ServiceId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let record = state
            .records
            .entry(service_id.clone())
            .or_insert_with(|| RecipientRecord::new(service_id.clone()));
        record.is_registered = true;
        if record.devices.is_empty() {
            record.devices.insert(PRIMARY_DEVICE_ID);
        }
        Ok(())
    }

    fn mark_unregistered(&self, service_id: &ServiceId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(service_id) else {
            return Ok(());
        };
        record.is_registered = false;
        record.devices.clear();
        if let Some(phone) = record.phone_number.take() {
            state.phones.remove(&phone);
        }
        Ok(())
    }

    fn unhide(&self, service_id: &ServiceId) -> Result<(), StoreError> {
        if let Some(record) = self.state.lock().records.get_mut(service_id) {
            record.is_hidden = false;
        }
        Ok(())
    }

    fn did_send_message(&self, service_id: &ServiceId) -> Result<(), StoreError> {
        self.state.lock().profile_shared.insert(service_id.clone());
        Ok(())
    }
}

// ── Threads ──

#[derive(Default)]
pub struct MemoryThreadStore {
    threads: Mutex<HashMap<ThreadId, Thread>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, thread: Thread) {
        self.threads.lock().insert(thread.id().clone(), thread);
    }
}

impl ThreadStore for MemoryThreadStore {
    fn thread(&self, id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        Ok(self.threads.lock().get(id).cloned())
    }
}

// ── Messages ──

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredMessage {
    pub recipient_states: BTreeMap<Address, RecipientState>,
    pub deleted: bool,
    pub transcript_synced: bool,
    pub read_locally: bool,
    pub viewed_locally: bool,
}

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<HashMap<u64, StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(&self, timestamp: u64) -> Option<StoredMessage> {
        self.messages.lock().get(&timestamp).cloned()
    }

    pub fn recipient_state(&self, timestamp: u64, address: &Address) -> Option<RecipientState> {
        self.messages
            .lock()
            .get(&timestamp)
            .and_then(|message| message.recipient_states.get(address).cloned())
    }

    pub fn mark_deleted(&self, timestamp: u64) {
        self.messages.lock().entry(timestamp).or_default().deleted = true;
    }
}

impl MessageStore for MemoryMessageStore {
    fn is_deleted(&self, timestamp: u64) -> Result<bool, StoreError> {
        Ok(self
            .messages
            .lock()
            .get(&timestamp)
            .is_some_and(|message| message.deleted))
    }

    fn update_recipient_states(
        &self,
        timestamp: u64,
        updates: &[(Address, RecipientState)],
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.lock();
        let message = messages.entry(timestamp).or_default();
        for (address, state) in updates {
            message
                .recipient_states
                .insert(address.clone(), state.clone());
        }
        Ok(())
    }

    fn replace_recipient(
        &self,
        timestamp: u64,
        from: &Address,
        to: &Address,
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.lock();
        let message = messages.entry(timestamp).or_default();
        if let Some(state) = message.recipient_states.remove(from) {
            message.recipient_states.insert(to.clone(), state);
        }
        Ok(())
    }

    fn mark_transcript_synced(&self, timestamp: u64) -> Result<(), StoreError> {
        self.messages
            .lock()
            .entry(timestamp)
            .or_default()
            .transcript_synced = true;
        Ok(())
    }

    fn mark_read_locally(&self, timestamp: u64, viewed: bool) -> Result<(), StoreError> {
        let mut messages = self.messages.lock();
        let message = messages.entry(timestamp).or_default();
        message.read_locally = true;
        message.viewed_locally |= viewed;
        Ok(())
    }
}

// ── Payload log ──

struct StoredPayload {
    plaintext: Vec<u8>,
    key: (ThreadId, u64, String),
}

#[derive(Default)]
struct PayloadState {
    next_id: i64,
    payloads: HashMap<PayloadId, StoredPayload>,
    by_key: HashMap<(ThreadId, u64, String), PayloadId>,
    pending: BTreeSet<(PayloadId, ServiceId, DeviceId)>,
}

#[derive(Default)]
pub struct MemoryPayloadLog {
    state: Mutex<PayloadState>,
}

impl MemoryPayloadLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PayloadLog for MemoryPayloadLog {
    fn record_payload(
        &self,
        thread: &ThreadId,
        timestamp: u64,
        plaintext: &[u8],
        _urgent: bool,
    ) -> Result<PayloadId, StoreError> {
        let key = (thread.clone(), timestamp, content_hash(plaintext));
        let mut state = self.state.lock();
        if let Some(id) = state.by_key.get(&key) {
            return Ok(*id);
        }
        state.next_id += 1;
        let id = PayloadId(state.next_id);
        state.by_key.insert(key.clone(), id);
        state.payloads.insert(
            id,
            StoredPayload {
                plaintext: plaintext.to_vec(),
                key,
            },
        );
        Ok(id)
    }

    fn record_pending_delivery(
        &self,
        payload: PayloadId,
        recipient: &ServiceId,
        devices: &[DeviceId],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if !state.payloads.contains_key(&payload) {
            return Err(StoreError::NotFound(format!("payload {}", payload.0)));
        }
        for device in devices {
            state.pending.insert((payload, recipient.clone(), *device));
        }
        Ok(())
    }

    fn record_successful_delivery(
        &self,
        payload: PayloadId,
        recipient: &ServiceId,
        device: DeviceId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.pending.remove(&(payload, recipient.clone(), device));
        let remaining = state.pending.iter().any(|(id, _, _)| *id == payload);
        if !remaining {
            if let Some(stored) = state.payloads.remove(&payload) {
                state.by_key.remove(&stored.key);
            }
        }
        Ok(())
    }

    fn payload(&self, payload: PayloadId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .state
            .lock()
            .payloads
            .get(&payload)
            .map(|stored| stored.plaintext.clone()))
    }

    fn pending_deliveries(
        &self,
        payload: PayloadId,
    ) -> Result<Vec<(ServiceId, DeviceId)>, StoreError> {
        Ok(self
            .state
            .lock()
            .pending
            .iter()
            .filter(|(id, _, _)| *id == payload)
            .map(|(_, recipient, device)| (recipient.clone(), *device))
            .collect())
    }
}
