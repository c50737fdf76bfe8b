use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use courier_crypto::{DistributionId, SenderKeyState};
use parking_lot::Mutex;
use tracing::info;

use crate::clock::{millis, Clock};
use crate::error::StoreError;
use crate::ids::{ServiceId, ThreadId};
use crate::store::{KeyRecipientDevice, SenderKeyStore};

struct ThreadSenderKey {
    state: SenderKeyState,
    /// Devices (with the registration id they had) that received the key.
    delivered: HashMap<ServiceId, BTreeSet<KeyRecipientDevice>>,
}

/// Sender keys held in memory, one per thread, created on first use.
pub struct MemorySenderKeyStore {
    clock: Arc<dyn Clock>,
    keys: Mutex<HashMap<ThreadId, ThreadSenderKey>>,
}

impl MemorySenderKeyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn with_key<T>(
        &self,
        thread: &ThreadId,
        f: impl FnOnce(&mut ThreadSenderKey) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut keys = self.keys.lock();
        let key = keys.entry(thread.clone()).or_insert_with(|| {
            let distribution_id = DistributionId::random();
            info!(thread = %thread, distribution_id = %distribution_id, "created sender key");
            ThreadSenderKey {
                state: SenderKeyState::generate(distribution_id, self.clock.now_ms()),
                delivered: HashMap::new(),
            }
        });
        f(key)
    }
}

impl SenderKeyStore for MemorySenderKeyStore {
    fn distribution_id(&self, thread: &ThreadId) -> Result<DistributionId, StoreError> {
        self.with_key(thread, |key| Ok(key.state.distribution_id()))
    }

    fn skdm_bytes(&self, thread: &ThreadId) -> Result<Vec<u8>, StoreError> {
        self.with_key(thread, |key| Ok(key.state.distribution_message().to_bytes()))
    }

    fn ready_recipients(
        &self,
        thread: &ThreadId,
        limited_to: &HashMap<ServiceId, BTreeSet<KeyRecipientDevice>>,
    ) -> Result<HashSet<ServiceId>, StoreError> {
        let keys = self.keys.lock();
        let Some(key) = keys.get(thread) else {
            return Ok(HashSet::new());
        };
        Ok(limited_to
            .iter()
            .filter(|(recipient, devices)| {
                !devices.is_empty() && key.delivered.get(*recipient) == Some(*devices)
            })
            .map(|(recipient, _)| recipient.clone())
            .collect())
    }

    fn record_sent_sender_keys(
        &self,
        thread: &ThreadId,
        delivered: &HashMap<ServiceId, BTreeSet<KeyRecipientDevice>>,
    ) -> Result<(), StoreError> {
        self.with_key(thread, |key| {
            for (recipient, devices) in delivered {
                key.delivered.insert(recipient.clone(), devices.clone());
            }
            Ok(())
        })
    }

    fn reset_delivery_record(
        &self,
        thread: &ThreadId,
        recipient: &ServiceId,
    ) -> Result<(), StoreError> {
        if let Some(key) = self.keys.lock().get_mut(thread) {
            key.delivered.remove(recipient);
        }
        Ok(())
    }

    fn expire_if_necessary(
        &self,
        thread: &ThreadId,
        max_age: Duration,
        members: &BTreeSet<ServiceId>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut keys = self.keys.lock();
        let Some(key) = keys.get(thread) else {
            return Ok(());
        };
        let too_old = now.saturating_sub(key.state.created_at_ms()) >= millis(max_age);
        let member_left = key.delivered.keys().any(|r| !members.contains(r));
        if too_old || member_left {
            info!(
                thread = %thread,
                distribution_id = %key.state.distribution_id(),
                too_old,
                member_left,
                "rotating sender key"
            );
            keys.remove(thread);
        }
        Ok(())
    }

    fn group_encrypt(&self, thread: &ThreadId, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.with_key(thread, |key| {
            key.state
                .encrypt(plaintext)
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use courier_crypto::sender_key::SenderKeyReceiver;
    use courier_crypto::SenderKeyDistributionMessage;

    use super::*;
    use crate::clock::ManualClock;

    fn devices(pairs: &[(u32, u32)]) -> BTreeSet<KeyRecipientDevice> {
        pairs
            .iter()
            .map(|(device_id, registration_id)| KeyRecipientDevice {
                device_id: *device_id,
                registration_id: *registration_id,
            })
            .collect()
    }

    #[test]
    fn ready_only_when_device_set_matches() {
        let store = MemorySenderKeyStore::new(Arc::new(ManualClock::new(0)));
        let thread = ThreadId::new("g");
        let alice = ServiceId::new("alice");
        let bob = ServiceId::new("bob");

        store
            .record_sent_sender_keys(
                &thread,
                &HashMap::from([(alice.clone(), devices(&[(1, 10)]))]),
            )
            .unwrap();

        let query = HashMap::from([
            (alice.clone(), devices(&[(1, 10)])),
            (bob.clone(), devices(&[(1, 20)])),
        ]);
        assert_eq!(
            store.ready_recipients(&thread, &query).unwrap(),
            HashSet::from([alice.clone()])
        );

        // A new device (or a re-registered one) needs a fresh distribution.
        let query = HashMap::from([(alice.clone(), devices(&[(1, 10), (2, 11)]))]);
        assert!(store.ready_recipients(&thread, &query).unwrap().is_empty());
        let query = HashMap::from([(alice, devices(&[(1, 12)]))]);
        assert!(store.ready_recipients(&thread, &query).unwrap().is_empty());
    }

    #[test]
    fn old_keys_rotate() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemorySenderKeyStore::new(clock.clone());
        let thread = ThreadId::new("g");
        let first = store.distribution_id(&thread).unwrap();

        store
            .expire_if_necessary(&thread, Duration::from_secs(60), &BTreeSet::new())
            .unwrap();
        assert_eq!(store.distribution_id(&thread).unwrap(), first);

        clock.advance(Duration::from_secs(61));
        store
            .expire_if_necessary(&thread, Duration::from_secs(60), &BTreeSet::new())
            .unwrap();
        assert_ne!(store.distribution_id(&thread).unwrap(), first);
    }

    #[test]
    fn departed_member_rotates_key() {
        let store = MemorySenderKeyStore::new(Arc::new(ManualClock::new(0)));
        let thread = ThreadId::new("g");
        let alice = ServiceId::new("alice");
        let first = store.distribution_id(&thread).unwrap();
        store
            .record_sent_sender_keys(&thread, &HashMap::from([(alice, devices(&[(1, 1)]))]))
            .unwrap();

        store
            .expire_if_necessary(&thread, Duration::from_secs(3600), &BTreeSet::new())
            .unwrap();
        assert_ne!(store.distribution_id(&thread).unwrap(), first);
    }

    #[test]
    fn distribution_message_decrypts_group_messages() {
        let store = MemorySenderKeyStore::new(Arc::new(ManualClock::new(0)));
        let thread = ThreadId::new("g");
        let skdm =
            SenderKeyDistributionMessage::from_bytes(&store.skdm_bytes(&thread).unwrap()).unwrap();
        let mut receiver = SenderKeyReceiver::from_distribution_message(&skdm);

        let ciphertext = store.group_encrypt(&thread, b"hello group").unwrap();
        assert_eq!(receiver.decrypt(&ciphertext).unwrap(), b"hello group");
    }
}
