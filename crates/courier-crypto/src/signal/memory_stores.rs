//! In-memory implementations of the session storage traits.
//!
//! Data is lost on process exit. Suitable for tests and for embedders that
//! persist key material elsewhere.

use std::collections::HashMap;

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::address::ProtocolAddress;
use crate::error::CryptoError;
use crate::identity::{Identity, IdentityKey};
use crate::signal::session::SessionRecord;
use crate::signal::store::{Direction, IdentityChange, IdentityKeyStore, PreKeyStore, SessionStore};

/// In-memory identity key store.
///
/// Pins remote identities per account using Trust On First Use.
pub struct MemoryIdentityStore {
    identity_secret: Zeroizing<[u8; 32]>,
    registration_id: u32,
    known: Mutex<HashMap<String, IdentityKey>>,
}

impl MemoryIdentityStore {
    pub fn new(identity: &Identity, registration_id: u32) -> Self {
        Self {
            identity_secret: Zeroizing::new(*identity.secret_key_bytes()),
            registration_id,
            known: Mutex::new(HashMap::new()),
        }
    }
}

impl IdentityKeyStore for MemoryIdentityStore {
    fn identity_key_pair(&self) -> Result<Identity, CryptoError> {
        Ok(Identity::from_secret_bytes(&self.identity_secret))
    }

    fn local_registration_id(&self) -> Result<u32, CryptoError> {
        Ok(self.registration_id)
    }

    fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
        direction: Direction,
    ) -> Result<bool, CryptoError> {
        if direction == Direction::Receiving {
            return Ok(true);
        }
        match self.known.lock().get(address.name()) {
            Some(stored) => Ok(stored == identity_key),
            None => Ok(true),
        }
    }

    fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
    ) -> Result<IdentityChange, CryptoError> {
        let previous = self
            .known
            .lock()
            .insert(address.name().to_string(), *identity_key);
        Ok(match previous {
            Some(old) if old != *identity_key => IdentityChange::ReplacedExisting,
            _ => IdentityChange::NewOrUnchanged,
        })
    }

    fn get_identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>, CryptoError> {
        Ok(self.known.lock().get(address.name()).copied())
    }
}

/// In-memory prekey store.
#[derive(Default)]
pub struct MemoryPreKeyStore {
    prekeys: Mutex<HashMap<u32, Zeroizing<[u8; 32]>>>,
    signed_prekeys: Mutex<HashMap<u32, Zeroizing<[u8; 32]>>>,
}

impl MemoryPreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreKeyStore for MemoryPreKeyStore {
    fn load_prekey(&self, prekey_id: u32) -> Result<Option<[u8; 32]>, CryptoError> {
        Ok(self.prekeys.lock().get(&prekey_id).map(|key| **key))
    }

    fn store_prekey(&self, prekey_id: u32, secret: &[u8; 32]) -> Result<(), CryptoError> {
        self.prekeys
            .lock()
            .insert(prekey_id, Zeroizing::new(*secret));
        Ok(())
    }

    fn remove_prekey(&self, prekey_id: u32) -> Result<(), CryptoError> {
        self.prekeys.lock().remove(&prekey_id);
        Ok(())
    }

    fn load_signed_prekey(&self, signed_prekey_id: u32) -> Result<Option<[u8; 32]>, CryptoError> {
        Ok(self
            .signed_prekeys
            .lock()
            .get(&signed_prekey_id)
            .map(|key| **key))
    }

    fn store_signed_prekey(
        &self,
        signed_prekey_id: u32,
        secret: &[u8; 32],
    ) -> Result<(), CryptoError> {
        self.signed_prekeys
            .lock()
            .insert(signed_prekey_id, Zeroizing::new(*secret));
        Ok(())
    }
}

/// In-memory session store keyed by device address.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<ProtocolAddress, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>, CryptoError> {
        Ok(self.sessions.lock().get(address).cloned())
    }

    fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), CryptoError> {
        self.sessions.lock().insert(address.clone(), record.clone());
        Ok(())
    }
}
