//! Sender keys: one symmetric chain per (sender, distribution) so that a group
//! message is encrypted once and readable by every member holding the key.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signer, SigningKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::codec::{ByteReader, ByteWriter};
use crate::error::CryptoError;
use crate::identity::IdentityKey;

const SENDER_KEY_VERSION: u8 = 1;
const SIGNATURE_LEN: usize = 64;
/// How far ahead of the receiver's chain a message may be.
const MAX_FORWARD_ITERATIONS: u32 = 2000;

/// Identifies one sender-key distribution (one per sending thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DistributionId([u8; 16]);

impl DistributionId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for DistributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Our sending side of a sender-key distribution.
pub struct SenderKeyState {
    distribution_id: DistributionId,
    chain_id: u32,
    iteration: u32,
    chain_key: Zeroizing<[u8; 32]>,
    signing_key: SigningKey,
    created_at_ms: u64,
}

impl SenderKeyState {
    /// Start a fresh chain for `distribution_id`.
    pub fn generate(distribution_id: DistributionId, created_at_ms: u64) -> Self {
        let mut chain_key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *chain_key);
        Self {
            distribution_id,
            chain_id: OsRng.next_u32(),
            iteration: 0,
            chain_key,
            signing_key: SigningKey::generate(&mut OsRng),
            created_at_ms,
        }
    }

    pub fn distribution_id(&self) -> DistributionId {
        self.distribution_id
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// The message that hands the current chain position to a recipient.
    pub fn distribution_message(&self) -> SenderKeyDistributionMessage {
        SenderKeyDistributionMessage {
            distribution_id: self.distribution_id,
            chain_id: self.chain_id,
            iteration: self.iteration,
            chain_key: *self.chain_key,
            signing_key: IdentityKey::from_bytes(self.signing_key.verifying_key().to_bytes()),
        }
    }

    /// Encrypt `plaintext` and advance the chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (message_key, next_chain_key) = step_chain(&self.chain_key)?;
        let cipher = Aes256Gcm::new_from_slice(&*message_key)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iteration_nonce(self.iteration)), plaintext)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let mut writer = ByteWriter::new();
        writer
            .u8(SENDER_KEY_VERSION)
            .raw(self.distribution_id.as_bytes())
            .u32(self.chain_id)
            .u32(self.iteration);
        writer.bytes(&ciphertext)?;
        let body = writer.finish();
        let signature = self.signing_key.sign(&body);

        self.chain_key = next_chain_key;
        self.iteration = self.iteration.wrapping_add(1);

        let mut message = body;
        message.extend_from_slice(&signature.to_bytes());
        Ok(message)
    }
}

/// Hands a sender-key chain to one recipient over a pairwise session.
#[derive(Clone, PartialEq, Eq)]
pub struct SenderKeyDistributionMessage {
    pub distribution_id: DistributionId,
    pub chain_id: u32,
    pub iteration: u32,
    chain_key: [u8; 32],
    pub signing_key: IdentityKey,
}

impl SenderKeyDistributionMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        ByteWriter::new()
            .u8(SENDER_KEY_VERSION)
            .raw(self.distribution_id.as_bytes())
            .u32(self.chain_id)
            .u32(self.iteration)
            .raw(&self.chain_key)
            .raw(self.signing_key.as_bytes())
            .finish()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = ByteReader::new(data);
        let version = reader.u8()?;
        if version != SENDER_KEY_VERSION {
            return Err(CryptoError::InvalidMessage(format!(
                "unsupported sender key version {version}"
            )));
        }
        Ok(Self {
            distribution_id: DistributionId::from_bytes(reader.array()?),
            chain_id: reader.u32()?,
            iteration: reader.u32()?,
            chain_key: reader.array()?,
            signing_key: IdentityKey::from_bytes(reader.array()?),
        })
    }
}

impl fmt::Debug for SenderKeyDistributionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderKeyDistributionMessage")
            .field("distribution_id", &self.distribution_id)
            .field("chain_id", &self.chain_id)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

/// A recipient's view of someone else's sender-key chain.
pub struct SenderKeyReceiver {
    distribution_id: DistributionId,
    chain_id: u32,
    iteration: u32,
    chain_key: Zeroizing<[u8; 32]>,
    signing_key: IdentityKey,
}

impl SenderKeyReceiver {
    pub fn from_distribution_message(message: &SenderKeyDistributionMessage) -> Self {
        Self {
            distribution_id: message.distribution_id,
            chain_id: message.chain_id,
            iteration: message.iteration,
            chain_key: Zeroizing::new(message.chain_key),
            signing_key: message.signing_key,
        }
    }

    /// Verify and decrypt a message produced by [`SenderKeyState::encrypt`].
    pub fn decrypt(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let split = message
            .len()
            .checked_sub(SIGNATURE_LEN)
            .ok_or_else(|| CryptoError::InvalidMessage("sender key message too short".into()))?;
        let (body, signature) = message.split_at(split);
        self.signing_key.verify(body, signature)?;

        let mut reader = ByteReader::new(body);
        let version = reader.u8()?;
        if version != SENDER_KEY_VERSION {
            return Err(CryptoError::InvalidMessage(format!(
                "unsupported sender key version {version}"
            )));
        }
        let distribution_id = DistributionId::from_bytes(reader.array()?);
        let chain_id = reader.u32()?;
        let iteration = reader.u32()?;
        let ciphertext = reader.bytes()?;
        if distribution_id != self.distribution_id || chain_id != self.chain_id {
            return Err(CryptoError::InvalidMessage(
                "message belongs to another sender key chain".into(),
            ));
        }
        if iteration < self.iteration {
            return Err(CryptoError::DecryptionError(format!(
                "iteration {iteration} already consumed"
            )));
        }
        if iteration - self.iteration > MAX_FORWARD_ITERATIONS {
            return Err(CryptoError::DecryptionError(
                "message too far ahead of chain".into(),
            ));
        }

        let mut chain_key = self.chain_key.clone();
        for _ in self.iteration..iteration {
            chain_key = step_chain(&chain_key)?.1;
        }
        let (message_key, next_chain_key) = step_chain(&chain_key)?;
        let cipher = Aes256Gcm::new_from_slice(&*message_key)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iteration_nonce(iteration)), ciphertext)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

        self.chain_key = next_chain_key;
        self.iteration = iteration.wrapping_add(1);
        Ok(plaintext)
    }
}

type ChainStep = (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>);

fn step_chain(chain_key: &[u8; 32]) -> Result<ChainStep, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, chain_key);
    let mut message_key = Zeroizing::new([0u8; 32]);
    let mut next_chain_key = Zeroizing::new([0u8; 32]);
    hk.expand(b"CourierSenderKeyMsg", &mut *message_key)
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF: {e}")))?;
    hk.expand(b"CourierSenderKeyChain", &mut *next_chain_key)
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF: {e}")))?;
    Ok((message_key, next_chain_key))
}

fn iteration_nonce(iteration: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[8..].copy_from_slice(&iteration.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiver_decrypts_in_order() {
        let mut sender = SenderKeyState::generate(DistributionId::random(), 1_000);
        let skdm = SenderKeyDistributionMessage::from_bytes(
            &sender.distribution_message().to_bytes(),
        )
        .unwrap();
        let mut receiver = SenderKeyReceiver::from_distribution_message(&skdm);

        for i in 0..3u8 {
            let message = sender.encrypt(&[i; 4]).unwrap();
            assert_eq!(receiver.decrypt(&message).unwrap(), vec![i; 4]);
        }
    }

    #[test]
    fn receiver_skips_ahead_but_rejects_replay() {
        let mut sender = SenderKeyState::generate(DistributionId::random(), 0);
        let mut receiver =
            SenderKeyReceiver::from_distribution_message(&sender.distribution_message());

        let first = sender.encrypt(b"one").unwrap();
        let second = sender.encrypt(b"two").unwrap();
        assert_eq!(receiver.decrypt(&second).unwrap(), b"two");
        assert!(receiver.decrypt(&first).is_err());
    }

    #[test]
    fn late_joiner_cannot_read_earlier_messages() {
        let mut sender = SenderKeyState::generate(DistributionId::random(), 0);
        let early = sender.encrypt(b"before").unwrap();
        let mut receiver =
            SenderKeyReceiver::from_distribution_message(&sender.distribution_message());
        assert!(receiver.decrypt(&early).is_err());
        let late = sender.encrypt(b"after").unwrap();
        assert_eq!(receiver.decrypt(&late).unwrap(), b"after");
    }

    #[test]
    fn tampered_message_fails_signature() {
        let mut sender = SenderKeyState::generate(DistributionId::random(), 0);
        let mut receiver =
            SenderKeyReceiver::from_distribution_message(&sender.distribution_message());
        let mut message = sender.encrypt(b"payload").unwrap();
        message[20] ^= 1;
        assert!(matches!(
            receiver.decrypt(&message),
            Err(CryptoError::VerificationError(_))
        ));
    }
}
