//! Sealed sender: hiding the sender's identity from the relay.
//!
//! The sender's identity travels inside the encrypted envelope as a
//! [`SenderCertificate`] issued by a trust root. The relay authorizes the
//! delivery with the recipient's [`AccessKey`] instead of the sender's
//! credentials.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::address::ProtocolAddress;
use crate::codec::{ByteReader, ByteWriter};
use crate::error::CryptoError;
use crate::identity::{Identity, IdentityKey};
use crate::signal::CiphertextMessageType;

const SEALED_VERSION: u8 = 1;
const MULTI_RECIPIENT_VERSION: u8 = 2;
const NONCE_LEN: usize = 24;

/// Registration ids must fit in 14 bits to be carried in a multi-recipient
/// message.
pub const REGISTRATION_ID_MASK: u32 = 0x3fff;

/// Proof, signed by a trust root, that `sender` owns `sender_identity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderCertificate {
    pub sender: String,
    pub sender_device: u32,
    pub sender_identity: IdentityKey,
    pub expires_ms: u64,
    pub signature: Vec<u8>,
}

impl SenderCertificate {
    /// Issue a certificate signed by `signer` (the trust root).
    pub fn issue(
        signer: &Identity,
        sender: impl Into<String>,
        sender_device: u32,
        sender_identity: IdentityKey,
        expires_ms: u64,
    ) -> Result<Self, CryptoError> {
        let sender = sender.into();
        let body = certificate_body(&sender, sender_device, &sender_identity, expires_ms)?;
        Ok(Self {
            sender,
            sender_device,
            sender_identity,
            expires_ms,
            signature: signer.sign(&body).to_bytes().to_vec(),
        })
    }

    /// Check the trust root's signature and the expiry.
    pub fn validate(&self, trust_root: &IdentityKey, now_ms: u64) -> Result<(), CryptoError> {
        let body = certificate_body(
            &self.sender,
            self.sender_device,
            &self.sender_identity,
            self.expires_ms,
        )?;
        trust_root.verify(&body, &self.signature)?;
        if now_ms >= self.expires_ms {
            return Err(CryptoError::VerificationError(
                "sender certificate expired".into(),
            ));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut writer = ByteWriter::new();
        writer.bytes(self.sender.as_bytes())?;
        writer
            .u32(self.sender_device)
            .raw(self.sender_identity.as_bytes())
            .u64(self.expires_ms);
        writer.bytes(&self.signature)?;
        Ok(writer.finish())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = ByteReader::new(data);
        let sender = String::from_utf8(reader.bytes()?.to_vec())
            .map_err(|e| CryptoError::InvalidMessage(e.to_string()))?;
        Ok(Self {
            sender,
            sender_device: reader.u32()?,
            sender_identity: IdentityKey::from_bytes(reader.array()?),
            expires_ms: reader.u64()?,
            signature: reader.bytes()?.to_vec(),
        })
    }
}

fn certificate_body(
    sender: &str,
    sender_device: u32,
    sender_identity: &IdentityKey,
    expires_ms: u64,
) -> Result<Vec<u8>, CryptoError> {
    let mut writer = ByteWriter::new();
    writer.bytes(sender.as_bytes())?;
    writer
        .u32(sender_device)
        .raw(sender_identity.as_bytes())
        .u64(expires_ms);
    Ok(writer.finish())
}

/// Per-recipient key that authorizes unidentified delivery at the relay.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessKey([u8; 16]);

impl AccessKey {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// XOR of all keys; the credential for one request to many recipients.
    pub fn combine<'a>(keys: impl IntoIterator<Item = &'a AccessKey>) -> AccessKey {
        let mut combined = [0u8; 16];
        for key in keys {
            for (out, byte) in combined.iter_mut().zip(key.0) {
                *out ^= byte;
            }
        }
        AccessKey(combined)
    }
}

impl std::fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessKey(..)")
    }
}

/// Plaintext inside a sealed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnidentifiedContent {
    pub sender_certificate: SenderCertificate,
    /// Type of the inner per-device ciphertext.
    pub message_type: CiphertextMessageType,
    pub contents: Vec<u8>,
    pub group_id: Option<Vec<u8>>,
}

impl UnidentifiedContent {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut writer = ByteWriter::new();
        writer.bytes(&self.sender_certificate.to_bytes()?)?;
        writer.u8(message_type_code(self.message_type));
        writer.bytes(&self.contents)?;
        match &self.group_id {
            Some(group_id) => {
                writer.u8(1).bytes(group_id)?;
            }
            None => {
                writer.u8(0);
            }
        }
        Ok(writer.finish())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = ByteReader::new(data);
        let sender_certificate = SenderCertificate::from_bytes(reader.bytes()?)?;
        let message_type = message_type_from_code(reader.u8()?)?;
        let contents = reader.bytes()?.to_vec();
        let group_id = match reader.u8()? {
            0 => None,
            _ => Some(reader.bytes()?.to_vec()),
        };
        Ok(Self {
            sender_certificate,
            message_type,
            contents,
            group_id,
        })
    }
}

fn message_type_code(message_type: CiphertextMessageType) -> u8 {
    match message_type {
        CiphertextMessageType::PreKey => 1,
        CiphertextMessageType::Whisper => 2,
        CiphertextMessageType::SenderKey => 3,
        CiphertextMessageType::Plaintext => 4,
    }
}

fn message_type_from_code(code: u8) -> Result<CiphertextMessageType, CryptoError> {
    match code {
        1 => Ok(CiphertextMessageType::PreKey),
        2 => Ok(CiphertextMessageType::Whisper),
        3 => Ok(CiphertextMessageType::SenderKey),
        4 => Ok(CiphertextMessageType::Plaintext),
        other => Err(CryptoError::InvalidMessage(format!(
            "unknown message type {other}"
        ))),
    }
}

/// Seal `content` for a single recipient identity.
///
/// Output: `version || ephemeral (32) || nonce (24) || ciphertext`.
pub fn seal(content: &UnidentifiedContent, recipient: &IdentityKey) -> Result<Vec<u8>, CryptoError> {
    let recipient_public = recipient.to_x25519()?;
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let key = derive_key(
        b"CourierSealedSender",
        ephemeral.diffie_hellman(&recipient_public).as_bytes(),
        &ephemeral_public,
        &recipient_public,
    )?;

    let (nonce, ciphertext) = aead_encrypt(&key, &content.to_bytes()?)?;
    Ok(ByteWriter::new()
        .u8(SEALED_VERSION)
        .raw(ephemeral_public.as_bytes())
        .raw(&nonce)
        .raw(&ciphertext)
        .finish())
}

/// Open an envelope produced by [`seal`].
pub fn open(identity: &Identity, envelope: &[u8]) -> Result<UnidentifiedContent, CryptoError> {
    let mut reader = ByteReader::new(envelope);
    let version = reader.u8()?;
    if version != SEALED_VERSION {
        return Err(CryptoError::InvalidMessage(format!(
            "unsupported sealed sender version {version}"
        )));
    }
    let ephemeral_public = X25519Public::from(reader.array::<32>()?);
    let nonce: [u8; NONCE_LEN] = reader.array()?;
    let ciphertext = reader.rest();

    let key = derive_key(
        b"CourierSealedSender",
        identity
            .to_x25519_secret()
            .diffie_hellman(&ephemeral_public)
            .as_bytes(),
        &ephemeral_public,
        &identity.to_x25519_public(),
    )?;
    UnidentifiedContent::from_bytes(&aead_decrypt(&key, &nonce, ciphertext)?)
}

/// One recipient device of a multi-recipient envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiRecipientDevice {
    pub address: ProtocolAddress,
    pub registration_id: u32,
    pub identity_key: IdentityKey,
}

/// Seal `content` once for many devices. The payload is encrypted a single
/// time under a random key which is then wrapped per device.
pub fn seal_multi_recipient(
    content: &UnidentifiedContent,
    devices: &[MultiRecipientDevice],
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let mut content_key = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut *content_key);

    let count = u32::try_from(devices.len())
        .map_err(|_| CryptoError::InvalidMessage("too many recipients".into()))?;
    let mut writer = ByteWriter::new();
    writer.u8(MULTI_RECIPIENT_VERSION).u32(count);
    for device in devices {
        let registration_id = u16::try_from(device.registration_id)
            .ok()
            .filter(|id| u32::from(*id) & !REGISTRATION_ID_MASK == 0)
            .ok_or_else(|| CryptoError::InvalidRegistrationId {
                address: device.address.clone(),
                registration_id: device.registration_id,
            })?;
        let recipient_public = device.identity_key.to_x25519()?;
        let wrap_key = derive_key(
            b"CourierMultiRecipient",
            ephemeral.diffie_hellman(&recipient_public).as_bytes(),
            &ephemeral_public,
            &recipient_public,
        )?;
        let mut wrapped = [0u8; 32];
        for (i, out) in wrapped.iter_mut().enumerate() {
            *out = content_key[i] ^ wrap_key[i];
        }
        writer.bytes(device.address.name().as_bytes())?;
        writer
            .u32(device.address.device_id())
            .u16(registration_id)
            .raw(&wrapped);
    }

    let (nonce, ciphertext) = aead_encrypt(&content_key, &content.to_bytes()?)?;
    Ok(writer
        .raw(ephemeral_public.as_bytes())
        .raw(&nonce)
        .raw(&ciphertext)
        .finish())
}

/// Recipient entry as the relay sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiRecipientEntry {
    pub address: ProtocolAddress,
    pub registration_id: u32,
    wrapped_key: [u8; 32],
}

/// A parsed multi-recipient envelope.
#[derive(Debug, Clone)]
pub struct MultiRecipientMessage {
    pub recipients: Vec<MultiRecipientEntry>,
    ephemeral_public: [u8; 32],
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl MultiRecipientMessage {
    pub fn parse(data: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = ByteReader::new(data);
        let version = reader.u8()?;
        if version != MULTI_RECIPIENT_VERSION {
            return Err(CryptoError::InvalidMessage(format!(
                "unsupported multi-recipient version {version}"
            )));
        }
        let count = reader.u32()?;
        let mut recipients = Vec::new();
        for _ in 0..count {
            let name = String::from_utf8(reader.bytes()?.to_vec())
                .map_err(|e| CryptoError::InvalidMessage(e.to_string()))?;
            let device_id = reader.u32()?;
            let registration_id = u32::from(reader.u16()?);
            recipients.push(MultiRecipientEntry {
                address: ProtocolAddress::new(name, device_id),
                registration_id,
                wrapped_key: reader.array()?,
            });
        }
        Ok(Self {
            recipients,
            ephemeral_public: reader.array()?,
            nonce: reader.array()?,
            ciphertext: reader.rest().to_vec(),
        })
    }

    /// Decrypt the shared payload as the device at `address`.
    pub fn open(
        &self,
        identity: &Identity,
        address: &ProtocolAddress,
    ) -> Result<UnidentifiedContent, CryptoError> {
        let entry = self
            .recipients
            .iter()
            .find(|entry| &entry.address == address)
            .ok_or_else(|| CryptoError::InvalidMessage(format!("{address} is not a recipient")))?;
        let ephemeral_public = X25519Public::from(self.ephemeral_public);
        let wrap_key = derive_key(
            b"CourierMultiRecipient",
            identity
                .to_x25519_secret()
                .diffie_hellman(&ephemeral_public)
                .as_bytes(),
            &ephemeral_public,
            &identity.to_x25519_public(),
        )?;
        let mut content_key = Zeroizing::new([0u8; 32]);
        for (i, out) in content_key.iter_mut().enumerate() {
            *out = entry.wrapped_key[i] ^ wrap_key[i];
        }
        UnidentifiedContent::from_bytes(&aead_decrypt(
            &content_key,
            &self.nonce,
            &self.ciphertext,
        )?)
    }
}

fn derive_key(
    label: &[u8],
    shared_secret: &[u8],
    ephemeral_public: &X25519Public,
    recipient_public: &X25519Public,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut info = Vec::with_capacity(label.len() + 64);
    info.extend_from_slice(label);
    info.extend_from_slice(ephemeral_public.as_bytes());
    info.extend_from_slice(recipient_public.as_bytes());

    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(&info, &mut *key)
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}

fn aead_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    Ok((nonce, ciphertext))
}

fn aead_decrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(sender: &Identity, trust_root: &Identity) -> UnidentifiedContent {
        let certificate =
            SenderCertificate::issue(trust_root, "alice", 1, sender.identity_key(), 10_000)
                .unwrap();
        UnidentifiedContent {
            sender_certificate: certificate,
            message_type: CiphertextMessageType::Whisper,
            contents: b"inner ciphertext".to_vec(),
            group_id: Some(b"group".to_vec()),
        }
    }

    #[test]
    fn certificate_validates_against_trust_root() {
        let trust_root = Identity::generate();
        let sender = Identity::generate();
        let certificate =
            SenderCertificate::issue(&trust_root, "alice", 2, sender.identity_key(), 5_000)
                .unwrap();

        assert!(certificate.validate(&trust_root.identity_key(), 4_999).is_ok());
        assert!(certificate.validate(&trust_root.identity_key(), 5_000).is_err());
        assert!(certificate
            .validate(&Identity::generate().identity_key(), 1_000)
            .is_err());

        let parsed = SenderCertificate::from_bytes(&certificate.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, certificate);
    }

    #[test]
    fn sealed_envelope_opens_only_for_recipient() {
        let trust_root = Identity::generate();
        let sender = Identity::generate();
        let recipient = Identity::generate();
        let content = content(&sender, &trust_root);

        let envelope = seal(&content, &recipient.identity_key()).unwrap();
        assert_eq!(open(&recipient, &envelope).unwrap(), content);
        assert!(open(&Identity::generate(), &envelope).is_err());
    }

    #[test]
    fn multi_recipient_envelope_opens_for_each_device() {
        let trust_root = Identity::generate();
        let sender = Identity::generate();
        let bob = Identity::generate();
        let carol = Identity::generate();
        let content = content(&sender, &trust_root);
        let devices = vec![
            MultiRecipientDevice {
                address: ProtocolAddress::new("bob", 1),
                registration_id: 11,
                identity_key: bob.identity_key(),
            },
            MultiRecipientDevice {
                address: ProtocolAddress::new("bob", 2),
                registration_id: 12,
                identity_key: bob.identity_key(),
            },
            MultiRecipientDevice {
                address: ProtocolAddress::new("carol", 1),
                registration_id: 13,
                identity_key: carol.identity_key(),
            },
        ];

        let envelope = seal_multi_recipient(&content, &devices).unwrap();
        let parsed = MultiRecipientMessage::parse(&envelope).unwrap();
        assert_eq!(parsed.recipients.len(), 3);
        assert_eq!(parsed.recipients[1].registration_id, 12);

        assert_eq!(
            parsed.open(&bob, &ProtocolAddress::new("bob", 2)).unwrap(),
            content
        );
        assert_eq!(
            parsed.open(&carol, &ProtocolAddress::new("carol", 1)).unwrap(),
            content
        );
        assert!(parsed.open(&carol, &ProtocolAddress::new("bob", 1)).is_err());
    }

    #[test]
    fn oversized_registration_id_is_rejected() {
        let trust_root = Identity::generate();
        let sender = Identity::generate();
        let devices = vec![MultiRecipientDevice {
            address: ProtocolAddress::new("bob", 1),
            registration_id: 0x4000,
            identity_key: Identity::generate().identity_key(),
        }];
        let err = seal_multi_recipient(&content(&sender, &trust_root), &devices).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidRegistrationId { registration_id: 0x4000, .. }));
    }

    #[test]
    fn access_keys_combine_by_xor() {
        let a = AccessKey::from_bytes([0b1010; 16]);
        let b = AccessKey::from_bytes([0b0110; 16]);
        assert_eq!(AccessKey::combine([&a, &b]).as_bytes(), &[0b1100; 16]);
        assert_eq!(AccessKey::combine([&a, &a]).as_bytes(), &[0; 16]);
    }
}
