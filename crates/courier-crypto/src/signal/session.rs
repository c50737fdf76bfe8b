use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use parking_lot::Mutex;
use sha2::Sha256;
use tracing::debug;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::address::ProtocolAddress;
use crate::codec::{ByteReader, ByteWriter};
use crate::error::CryptoError;
use crate::identity::IdentityKey;
use crate::signal::prekeys::{OneTimePreKey, PreKeyBundle};
use crate::signal::store::{Direction, IdentityChange, IdentityKeyStore, PreKeyStore, SessionStore};

const PREKEY_MESSAGE_VERSION: u8 = 1;
const MAX_ARCHIVED_STATES: usize = 40;

/// Wire type of an encrypted per-device payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CiphertextMessageType {
    /// First messages of a session, carrying the X3DH setup.
    PreKey,
    /// Normal ratchet message.
    Whisper,
    /// Group message encrypted under a sender key.
    SenderKey,
    /// Unencrypted content (decryption-error receipts).
    Plaintext,
}

/// An encrypted payload for a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextMessage {
    pub message_type: CiphertextMessageType,
    pub body: Vec<u8>,
}

/// Outcome of processing a prekey bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Established,
    /// A current session already existed; the bundle was not used.
    AlreadyPresent,
}

/// What the current session knows about the remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSession {
    pub registration_id: u32,
    pub identity_key: IdentityKey,
}

/// Symmetric chain state of a session.
#[derive(Clone)]
struct RatchetState {
    sending_chain_key: [u8; 32],
    receiving_chain_key: [u8; 32],
    send_counter: u64,
}

impl RatchetState {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (message_key, next_chain_key) = step_chain(&self.sending_chain_key)
            .map_err(CryptoError::EncryptionError)?;
        self.send_counter += 1;

        let cipher = Aes256Gcm::new_from_slice(&message_key)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
        let nonce_bytes = counter_nonce(self.send_counter);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
        self.sending_chain_key = next_chain_key;

        Ok(ByteWriter::new()
            .u64(self.send_counter)
            .raw(&ciphertext)
            .finish())
    }

    fn decrypt(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut reader = ByteReader::new(message);
        let counter = reader.u64()?;
        let ciphertext = reader.rest();

        let (message_key, next_chain_key) = step_chain(&self.receiving_chain_key)
            .map_err(CryptoError::DecryptionError)?;
        let cipher = Aes256Gcm::new_from_slice(&message_key)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&counter_nonce(counter)), ciphertext)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
        self.receiving_chain_key = next_chain_key;
        Ok(plaintext)
    }
}

/// Prekey ids the initiator keeps advertising until the peer answers.
#[derive(Clone, Copy)]
struct PendingPreKey {
    signed_prekey_id: u32,
    one_time_prekey_id: Option<u32>,
}

#[derive(Clone)]
struct SessionState {
    ratchet: RatchetState,
    remote_registration_id: u32,
    remote_identity: IdentityKey,
    /// Initiator's X3DH ephemeral public key; identifies the session on both sides.
    base_key: [u8; 32],
    pending_prekey: Option<PendingPreKey>,
}

/// All session states held for one device address: the current one plus
/// archived states that may still decrypt late messages.
#[derive(Clone, Default)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: Vec<SessionState>,
}

impl SessionRecord {
    pub fn has_current_session(&self) -> bool {
        self.current.is_some()
    }

    /// Number of archived states kept for late messages.
    pub fn archived_count(&self) -> usize {
        self.previous.len()
    }

    /// Move the current state to the archive. The next send must build a new
    /// session from a prekey bundle.
    pub fn archive_current_state(&mut self) {
        if let Some(state) = self.current.take() {
            self.previous.insert(0, state);
            self.previous.truncate(MAX_ARCHIVED_STATES);
        }
    }

    pub fn remote_session(&self) -> Option<RemoteSession> {
        self.current.as_ref().map(|state| RemoteSession {
            registration_id: state.remote_registration_id,
            identity_key: state.remote_identity,
        })
    }

    fn promote_state(&mut self, state: SessionState) {
        self.archive_current_state();
        self.current = Some(state);
    }
}

/// Manages pairwise sessions: X3DH establishment from prekey bundles and a
/// symmetric-chain ratchet for message encryption.
///
/// Establishment and encryption for the same store are serialized so that
/// concurrent callers never create two sessions for one device.
#[allow(clippy::struct_field_names)]
pub struct SignalSessionManager {
    identity_store: Box<dyn IdentityKeyStore>,
    prekey_store: Box<dyn PreKeyStore>,
    session_store: Box<dyn SessionStore>,
    write_lock: Mutex<()>,
}

impl SignalSessionManager {
    pub fn new(
        identity_store: Box<dyn IdentityKeyStore>,
        prekey_store: Box<dyn PreKeyStore>,
        session_store: Box<dyn SessionStore>,
    ) -> Self {
        Self {
            identity_store,
            prekey_store,
            session_store,
            write_lock: Mutex::new(()),
        }
    }

    /// Build a session with `address` from its published bundle (initiator X3DH).
    ///
    /// Returns [`SessionOutcome::AlreadyPresent`] without touching the bundle
    /// when a current session exists.
    pub fn process_prekey_bundle(
        &self,
        address: &ProtocolAddress,
        bundle: &PreKeyBundle,
    ) -> Result<SessionOutcome, CryptoError> {
        let _guard = self.write_lock.lock();

        let mut record = self.session_store.load_session(address)?.unwrap_or_default();
        if record.has_current_session() {
            return Ok(SessionOutcome::AlreadyPresent);
        }

        bundle
            .verify_signature()
            .map_err(|_| CryptoError::InvalidSignature(address.clone()))?;
        if !self
            .identity_store
            .is_trusted_identity(address, &bundle.identity_key, Direction::Sending)?
        {
            return Err(CryptoError::UntrustedIdentity(address.name().to_string()));
        }

        let identity = self.identity_store.identity_key_pair()?;
        let ephemeral_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = X25519Public::from(&ephemeral_secret);

        let their_identity = bundle.identity_key.to_x25519()?;
        let their_signed_prekey = X25519Public::from(bundle.signed_prekey);

        let dh1 = identity.to_x25519_secret().diffie_hellman(&their_signed_prekey);
        let dh2 = ephemeral_secret.diffie_hellman(&their_identity);
        let dh3 = ephemeral_secret.diffie_hellman(&their_signed_prekey);

        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(dh1.as_bytes());
        ikm.extend_from_slice(dh2.as_bytes());
        ikm.extend_from_slice(dh3.as_bytes());
        if let Some(otpk) = &bundle.one_time_prekey {
            let dh4 = ephemeral_secret.diffie_hellman(&X25519Public::from(otpk.public_key));
            ikm.extend_from_slice(dh4.as_bytes());
        }
        let (first, second) = derive_chain_keys(&ikm)?;

        record.promote_state(SessionState {
            ratchet: RatchetState {
                sending_chain_key: first,
                receiving_chain_key: second,
                send_counter: 0,
            },
            remote_registration_id: bundle.registration_id,
            remote_identity: bundle.identity_key,
            base_key: *ephemeral_public.as_bytes(),
            pending_prekey: Some(PendingPreKey {
                signed_prekey_id: bundle.signed_prekey_id,
                one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|otpk| otpk.id),
            }),
        });
        self.session_store.store_session(address, &record)?;
        self.identity_store.save_identity(address, &bundle.identity_key)?;

        debug!(address = %address, "session established from prekey bundle");
        Ok(SessionOutcome::Established)
    }

    /// Encrypt `plaintext` for one device using its current session.
    pub fn encrypt(
        &self,
        address: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<CiphertextMessage, CryptoError> {
        let _guard = self.write_lock.lock();

        let mut record = self
            .session_store
            .load_session(address)?
            .ok_or_else(|| CryptoError::SessionNotFound(address.clone()))?;
        let local_registration_id = self.identity_store.local_registration_id()?;
        let state = record
            .current
            .as_mut()
            .ok_or_else(|| CryptoError::SessionNotFound(address.clone()))?;

        if let Some(pinned) = self.identity_store.get_identity(address)? {
            if pinned != state.remote_identity {
                return Err(CryptoError::IdentityKeyMismatch(address.clone()));
            }
        }
        if !self
            .identity_store
            .is_trusted_identity(address, &state.remote_identity, Direction::Sending)?
        {
            return Err(CryptoError::UntrustedIdentity(address.name().to_string()));
        }

        let whisper = state.ratchet.encrypt(plaintext)?;
        let message = match state.pending_prekey {
            None => CiphertextMessage {
                message_type: CiphertextMessageType::Whisper,
                body: whisper,
            },
            Some(pending) => {
                let identity = self.identity_store.identity_key_pair()?;
                let mut writer = ByteWriter::new();
                writer
                    .u8(PREKEY_MESSAGE_VERSION)
                    .u32(local_registration_id)
                    .u32(pending.signed_prekey_id);
                match pending.one_time_prekey_id {
                    Some(id) => writer.u8(1).u32(id),
                    None => writer.u8(0),
                };
                writer
                    .raw(&state.base_key)
                    .raw(identity.identity_key().as_bytes())
                    .raw(&whisper);
                CiphertextMessage {
                    message_type: CiphertextMessageType::PreKey,
                    body: writer.finish(),
                }
            }
        };

        self.session_store.store_session(address, &record)?;
        Ok(message)
    }

    /// Decrypt a pairwise message from `address`, answering the X3DH setup
    /// when the message opens a new session.
    pub fn decrypt(
        &self,
        address: &ProtocolAddress,
        message: &CiphertextMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let _guard = self.write_lock.lock();
        let mut record = self.session_store.load_session(address)?.unwrap_or_default();

        let plaintext = match message.message_type {
            CiphertextMessageType::Whisper => decrypt_with_record(&mut record, &message.body)?,
            CiphertextMessageType::PreKey => self.decrypt_prekey(address, &mut record, &message.body)?,
            other => {
                return Err(CryptoError::InvalidMessage(format!(
                    "{other:?} is not a pairwise message"
                )))
            }
        };

        self.session_store.store_session(address, &record)?;
        Ok(plaintext)
    }

    fn decrypt_prekey(
        &self,
        address: &ProtocolAddress,
        record: &mut SessionRecord,
        body: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut reader = ByteReader::new(body);
        let version = reader.u8()?;
        if version != PREKEY_MESSAGE_VERSION {
            return Err(CryptoError::InvalidMessage(format!(
                "unsupported prekey message version {version}"
            )));
        }
        let remote_registration_id = reader.u32()?;
        let signed_prekey_id = reader.u32()?;
        let one_time_prekey_id = match reader.u8()? {
            0 => None,
            _ => Some(reader.u32()?),
        };
        let base_key: [u8; 32] = reader.array()?;
        let remote_identity = IdentityKey::from_bytes(reader.array()?);
        let whisper = reader.rest();

        let known_session = record
            .current
            .as_ref()
            .is_some_and(|state| state.base_key == base_key);
        if !known_session {
            if !self
                .identity_store
                .is_trusted_identity(address, &remote_identity, Direction::Receiving)?
            {
                return Err(CryptoError::UntrustedIdentity(address.name().to_string()));
            }
            let state = self.respond_to_session(
                remote_registration_id,
                remote_identity,
                base_key,
                signed_prekey_id,
                one_time_prekey_id,
            )?;
            record.promote_state(state);
            self.identity_store.save_identity(address, &remote_identity)?;
            debug!(address = %address, "session established from prekey message");
        }

        decrypt_with_record(record, whisper)
    }

    /// Responder side of X3DH.
    fn respond_to_session(
        &self,
        remote_registration_id: u32,
        remote_identity: IdentityKey,
        base_key: [u8; 32],
        signed_prekey_id: u32,
        one_time_prekey_id: Option<u32>,
    ) -> Result<SessionState, CryptoError> {
        let identity = self.identity_store.identity_key_pair()?;
        let signed_prekey = StaticSecret::from(
            self.prekey_store
                .load_signed_prekey(signed_prekey_id)?
                .ok_or_else(|| CryptoError::InvalidKey("signed prekey not found".into()))?,
        );
        let their_identity = remote_identity.to_x25519()?;
        let their_ephemeral = X25519Public::from(base_key);

        // Mirror of the initiator's DH1..DH3.
        let dh1 = signed_prekey.diffie_hellman(&their_identity);
        let dh2 = identity.to_x25519_secret().diffie_hellman(&their_ephemeral);
        let dh3 = signed_prekey.diffie_hellman(&their_ephemeral);

        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(dh1.as_bytes());
        ikm.extend_from_slice(dh2.as_bytes());
        ikm.extend_from_slice(dh3.as_bytes());
        if let Some(otpk_id) = one_time_prekey_id {
            let otpk = StaticSecret::from(
                self.prekey_store
                    .load_prekey(otpk_id)?
                    .ok_or_else(|| CryptoError::InvalidKey("one-time prekey not found".into()))?,
            );
            ikm.extend_from_slice(otpk.diffie_hellman(&their_ephemeral).as_bytes());
            self.prekey_store.remove_prekey(otpk_id)?;
        }
        let (first, second) = derive_chain_keys(&ikm)?;

        Ok(SessionState {
            ratchet: RatchetState {
                sending_chain_key: second,
                receiving_chain_key: first,
                send_counter: 0,
            },
            remote_registration_id,
            remote_identity,
            base_key,
            pending_prekey: None,
        })
    }

    pub fn has_current_session(&self, address: &ProtocolAddress) -> Result<bool, CryptoError> {
        Ok(self
            .session_store
            .load_session(address)?
            .is_some_and(|record| record.has_current_session()))
    }

    /// Archive the current session for `address`, if any.
    pub fn archive_session(&self, address: &ProtocolAddress) -> Result<(), CryptoError> {
        let _guard = self.write_lock.lock();
        if let Some(mut record) = self.session_store.load_session(address)? {
            if record.has_current_session() {
                record.archive_current_state();
                self.session_store.store_session(address, &record)?;
                debug!(address = %address, "archived session");
            }
        }
        Ok(())
    }

    pub fn remote_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<RemoteSession>, CryptoError> {
        Ok(self
            .session_store
            .load_session(address)?
            .and_then(|record| record.remote_session()))
    }

    pub fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
    ) -> Result<IdentityChange, CryptoError> {
        self.identity_store.save_identity(address, identity_key)
    }

    pub fn local_registration_id(&self) -> Result<u32, CryptoError> {
        self.identity_store.local_registration_id()
    }

    /// Create and store a signed prekey (plus optional one-time prekey) and
    /// return the bundle to publish for `device_id`.
    pub fn generate_prekey_bundle(
        &self,
        device_id: u32,
        signed_prekey_id: u32,
        one_time_prekey_id: Option<u32>,
    ) -> Result<PreKeyBundle, CryptoError> {
        let identity = self.identity_store.identity_key_pair()?;
        let registration_id = self.identity_store.local_registration_id()?;

        let signed_prekey_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let signed_prekey = *X25519Public::from(&signed_prekey_secret).as_bytes();
        self.prekey_store
            .store_signed_prekey(signed_prekey_id, &signed_prekey_secret.to_bytes())?;
        let signed_prekey_signature = identity.sign(&signed_prekey).to_bytes().to_vec();

        let one_time_prekey = match one_time_prekey_id {
            Some(id) => {
                let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
                self.prekey_store.store_prekey(id, &secret.to_bytes())?;
                Some(OneTimePreKey {
                    id,
                    public_key: *X25519Public::from(&secret).as_bytes(),
                })
            }
            None => None,
        };

        Ok(PreKeyBundle {
            device_id,
            registration_id,
            identity_key: identity.identity_key(),
            signed_prekey_id,
            signed_prekey,
            signed_prekey_signature,
            one_time_prekey,
        })
    }
}

/// Try the current state, then archived ones; a successful archived state
/// becomes current again.
fn decrypt_with_record(record: &mut SessionRecord, whisper: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut last_error = CryptoError::DecryptionError("no session state".into());
    if let Some(state) = record.current.as_mut() {
        match state.ratchet.decrypt(whisper) {
            Ok(plaintext) => {
                // The peer answered, so it holds the session.
                state.pending_prekey = None;
                return Ok(plaintext);
            }
            Err(e) => last_error = e,
        }
    }
    for index in 0..record.previous.len() {
        if let Ok(plaintext) = record.previous[index].ratchet.decrypt(whisper) {
            let mut state = record.previous.remove(index);
            state.pending_prekey = None;
            record.promote_state(state);
            return Ok(plaintext);
        }
    }
    Err(last_error)
}

fn derive_chain_keys(ikm: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 64];
    hk.expand(b"CourierX3DH", &mut okm)
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {e}")))?;
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    Ok((first, second))
}

fn step_chain(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), String> {
    let hk = Hkdf::<Sha256>::new(None, chain_key);
    let mut message_key = [0u8; 32];
    let mut next_chain_key = [0u8; 32];
    hk.expand(b"CourierMsgKey", &mut message_key)
        .map_err(|e| format!("HKDF: {e}"))?;
    hk.expand(b"CourierChainKey", &mut next_chain_key)
        .map_err(|e| format!("HKDF: {e}"))?;
    Ok((message_key, next_chain_key))
}

fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}
