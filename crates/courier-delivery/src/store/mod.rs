//! Collaborator stores the delivery engine reads and writes.
//!
//! Every method is a single atomic operation against its backing store; the
//! engine never spans a read-modify-write across two calls.

pub mod memory;
pub mod sender_keys;
pub mod sqlite;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use courier_crypto::{AccessKey, DistributionId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::ids::{Address, DeviceId, ServiceId, ThreadId};
use crate::message::RecipientState;
use crate::thread::Thread;

pub use memory::{MemoryMessageStore, MemoryPayloadLog, MemoryRecipientDirectory, MemoryThreadStore};
pub use sender_keys::MemorySenderKeyStore;
pub use sqlite::SqlitePayloadLog;

/// What we know about a remote account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientRecord {
    pub service_id: ServiceId,
    pub phone_number: Option<String>,
    pub devices: BTreeSet<DeviceId>,
    pub is_registered: bool,
    /// Sealed-sender access key, when unidentified delivery is enabled.
    pub access_key: Option<AccessKey>,
    pub is_hidden: bool,
}

impl RecipientRecord {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            phone_number: None,
            devices: BTreeSet::new(),
            is_registered: true,
            access_key: None,
            is_hidden: false,
        }
    }
}

pub trait RecipientDirectory: Send + Sync {
    /// Service id previously linked to a phone number.
    fn service_id_for_phone(&self, phone_number: &str) -> Result<Option<ServiceId>, StoreError>;

    fn link_phone_number(&self, phone_number: &str, service_id: &ServiceId)
        -> Result<(), StoreError>;

    fn is_blocked(&self, address: &Address) -> Result<bool, StoreError>;

    fn recipient(&self, service_id: &ServiceId) -> Result<Option<RecipientRecord>, StoreError>;

    /// Add and remove devices in one write, creating the record if needed.
    fn update_devices(
        &self,
        service_id: &ServiceId,
        add: &[DeviceId],
        remove: &[DeviceId],
    ) -> Result<(), StoreError>;

    /// Registered accounts always have at least the primary device.
    fn mark_registered(&self, service_id: &ServiceId) -> Result<(), StoreError>;

    /// Clears the device list and splits off any linked phone number.
    fn mark_unregistered(&self, service_id: &ServiceId) -> Result<(), StoreError>;

    fn unhide(&self, service_id: &ServiceId) -> Result<(), StoreError>;

    /// Called after every successful delivery (profile sharing hook).
    fn did_send_message(&self, service_id: &ServiceId) -> Result<(), StoreError>;
}

pub trait ThreadStore: Send + Sync {
    fn thread(&self, id: &ThreadId) -> Result<Option<Thread>, StoreError>;
}

/// Persistent copy of outgoing messages, keyed by timestamp.
pub trait MessageStore: Send + Sync {
    /// Whether the message was remotely deleted before it went out.
    fn is_deleted(&self, timestamp: u64) -> Result<bool, StoreError>;

    fn update_recipient_states(
        &self,
        timestamp: u64,
        updates: &[(Address, RecipientState)],
    ) -> Result<(), StoreError>;

    /// Re-key a recipient after its phone number resolved to a service id.
    fn replace_recipient(&self, timestamp: u64, from: &Address, to: &Address)
        -> Result<(), StoreError>;

    fn mark_transcript_synced(&self, timestamp: u64) -> Result<(), StoreError>;

    /// Mark read (and viewed) on this device, for note-to-self messages.
    fn mark_read_locally(&self, timestamp: u64, viewed: bool) -> Result<(), StoreError>;
}

/// One device a sender key was handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyRecipientDevice {
    pub device_id: DeviceId,
    pub registration_id: u32,
}

/// Per-thread sender-key state and the record of who holds it.
pub trait SenderKeyStore: Send + Sync {
    fn distribution_id(&self, thread: &ThreadId) -> Result<DistributionId, StoreError>;

    /// Serialized distribution message for the thread's current key.
    fn skdm_bytes(&self, thread: &ThreadId) -> Result<Vec<u8>, StoreError>;

    /// Recipients holding the current key on exactly the given devices.
    fn ready_recipients(
        &self,
        thread: &ThreadId,
        limited_to: &HashMap<ServiceId, BTreeSet<KeyRecipientDevice>>,
    ) -> Result<HashSet<ServiceId>, StoreError>;

    fn record_sent_sender_keys(
        &self,
        thread: &ThreadId,
        delivered: &HashMap<ServiceId, BTreeSet<KeyRecipientDevice>>,
    ) -> Result<(), StoreError>;

    /// Forget that `recipient` holds the key (its sessions went stale).
    fn reset_delivery_record(&self, thread: &ThreadId, recipient: &ServiceId)
        -> Result<(), StoreError>;

    /// Rotate the key if it is older than `max_age` or was handed to someone
    /// no longer in `members`.
    fn expire_if_necessary(
        &self,
        thread: &ThreadId,
        max_age: Duration,
        members: &BTreeSet<ServiceId>,
    ) -> Result<(), StoreError>;

    fn group_encrypt(&self, thread: &ThreadId, plaintext: &[u8]) -> Result<Vec<u8>, StoreError>;
}

/// Row id of a recorded plaintext payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PayloadId(pub i64);

/// Plaintexts kept so that recipients who fail to decrypt can ask for a
/// resend, with the devices that still owe a delivery receipt.
pub trait PayloadLog: Send + Sync {
    /// Idempotent for the same `(thread, timestamp, plaintext)`.
    fn record_payload(
        &self,
        thread: &ThreadId,
        timestamp: u64,
        plaintext: &[u8],
        urgent: bool,
    ) -> Result<PayloadId, StoreError>;

    fn record_pending_delivery(
        &self,
        payload: PayloadId,
        recipient: &ServiceId,
        devices: &[DeviceId],
    ) -> Result<(), StoreError>;

    /// Drops the pending row; the payload goes once no rows remain.
    fn record_successful_delivery(
        &self,
        payload: PayloadId,
        recipient: &ServiceId,
        device: DeviceId,
    ) -> Result<(), StoreError>;

    fn payload(&self, payload: PayloadId) -> Result<Option<Vec<u8>>, StoreError>;

    fn pending_deliveries(&self, payload: PayloadId)
        -> Result<Vec<(ServiceId, DeviceId)>, StoreError>;
}

/// Dedup key of a recorded plaintext.
pub(crate) fn content_hash(plaintext: &[u8]) -> String {
    hex::encode(Sha256::digest(plaintext))
}
