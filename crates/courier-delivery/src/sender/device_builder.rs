//! Per-device encryption, establishing sessions from prekey bundles when a
//! device has none.

use std::collections::{BTreeSet, HashSet};

use courier_crypto::sealed_sender;
use courier_crypto::signal::{CiphertextMessage, CiphertextMessageType, SessionOutcome};
use courier_crypto::{CryptoError, ProtocolAddress, UnidentifiedContent};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{RelayError, SendError};
use crate::ids::{DeviceId, ServiceId};
use crate::message::EncryptionStyle;
use crate::relay::{DeviceMessage, DeviceMessageType, DeviceSelector, RelayAuth};
use crate::sender::{MessageSend, MessageSender, SealedSenderParameters};

impl MessageSender {
    /// One device message per known device of the recipient.
    ///
    /// Empty when the recipient is unregistered or has no devices on
    /// record; the caller decides whether to check the account.
    pub(crate) async fn build_device_messages(
        &self,
        send: &MessageSend,
        sealed: Option<&SealedSenderParameters>,
    ) -> Result<Vec<DeviceMessage>, SendError> {
        let recipient = &send.recipient;
        let mut messages = Vec::new();
        let mut missing = Vec::new();
        for device_id in self.sendable_devices(send)? {
            match self.encrypt_for_device(send, device_id, sealed) {
                Ok(message) => messages.push(message),
                Err(SendError::MissingSession { .. }) => missing.push(device_id),
                Err(error) => return Err(error),
            }
        }
        if missing.is_empty() {
            return Ok(messages);
        }

        if send.message.kind.is_transient() {
            debug!(recipient = %recipient, "no session for transient message");
            return Err(SendError::NoSessionForTransientMessage);
        }

        if messages.is_empty() {
            // No sessions at all: one fetch covers every device and tells us
            // the current device list.
            match self.create_sessions(send, DeviceSelector::All, sealed).await {
                Err(error) if error.http_status() == Some(404) => {
                    return Err(self.handle_404(send).await);
                }
                result => result?,
            }
        } else {
            let fetches = missing.iter().map(|&device_id| async move {
                match self
                    .create_sessions(send, DeviceSelector::Device(device_id), sealed)
                    .await
                {
                    Err(error) if error.http_status() == Some(404) => {
                        warn!(recipient = %recipient, device_id, "prekey fetch found no such device, removing it");
                        self.update_devices_and_archive(recipient, &[], &[device_id])
                    }
                    result => result,
                }
            });
            for result in join_all(fetches).await {
                result?;
            }
        }

        // The fetches may have added or removed devices.
        let built: HashSet<DeviceId> = messages.iter().map(|m| m.destination_device_id).collect();
        for device_id in self.sendable_devices(send)? {
            if built.contains(&device_id) {
                continue;
            }
            match self.encrypt_for_device(send, device_id, sealed) {
                Ok(message) => messages.push(message),
                Err(error @ SendError::MissingSession { .. }) => {
                    warn!(recipient = %recipient, device_id, "session vanished right after it was created");
                    return Err(error);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(messages)
    }

    /// Devices to encrypt for: none when unregistered, and never our own
    /// device.
    fn sendable_devices(&self, send: &MessageSend) -> Result<BTreeSet<DeviceId>, SendError> {
        let Some(record) = self.services.recipients.recipient(&send.recipient)? else {
            return Ok(BTreeSet::new());
        };
        if !record.is_registered {
            return Ok(BTreeSet::new());
        }
        let mut devices = record.devices;
        if send.is_self_send() {
            devices.remove(&send.local.device_id);
        }
        Ok(devices)
    }

    /// Fetch prekeys and establish sessions for the selected devices.
    async fn create_sessions(
        &self,
        send: &MessageSend,
        selector: DeviceSelector,
        sealed: Option<&SealedSenderParameters>,
    ) -> Result<(), SendError> {
        let recipient = &send.recipient;
        // Prekey fetches are strictly rate limited; skip ones bound to fail.
        if self.recent_failures.has_recent_untrusted_identity(recipient) {
            warn!(recipient = %recipient, "skipping prekey fetch, identity recently untrusted");
            return Err(SendError::UntrustedIdentity(recipient.clone()));
        }
        if self.recent_failures.will_likely_have_invalid_signature(recipient) {
            warn!(recipient = %recipient, "skipping prekey fetch, repeated invalid signatures");
            return Err(SendError::InvalidKeySignature {
                recipient: recipient.clone(),
                terminal: true,
            });
        }

        let auth = sealed.map_or(RelayAuth::Identified, |params| {
            params.relay_auth(send.message.is_story())
        });
        let bundles = self
            .relay_call(self.services.relay.fetch_prekeys(recipient, selector, auth))
            .await
            .map_err(prekey_fetch_error)?;

        let local_device = send.is_self_send().then_some(send.local.device_id);
        for bundle in &bundles {
            if Some(bundle.device_id) == local_device {
                continue;
            }
            let address = recipient.protocol_address(bundle.device_id);
            match self.services.sessions.process_prekey_bundle(&address, bundle) {
                Ok(SessionOutcome::Established) => {
                    info!(
                        recipient = %recipient,
                        device_id = bundle.device_id,
                        signed_prekey_id = bundle.signed_prekey_id,
                        one_time_prekey = bundle.one_time_prekey.is_some(),
                        "created session"
                    );
                }
                Ok(SessionOutcome::AlreadyPresent) => {
                    debug!(recipient = %recipient, device_id = bundle.device_id, "session already exists");
                }
                Err(CryptoError::InvalidSignature(_)) => {
                    warn!(recipient = %recipient, device_id = bundle.device_id, "invalid signed prekey signature");
                    self.recent_failures.record_invalid_signature(recipient);
                    return Err(SendError::InvalidKeySignature {
                        recipient: recipient.clone(),
                        terminal: false,
                    });
                }
                Err(CryptoError::UntrustedIdentity(_) | CryptoError::IdentityKeyMismatch(_)) => {
                    warn!(
                        recipient = %recipient,
                        identity = %hex::encode(&bundle.identity_key.as_bytes()[..8]),
                        "untrusted identity in prekey bundle"
                    );
                    self.recent_failures.record_untrusted_identity(recipient);
                    self.services
                        .sessions
                        .save_identity(&address, &bundle.identity_key)?;
                    return Err(SendError::UntrustedIdentity(recipient.clone()));
                }
                Err(error) => return Err(error.into()),
            }
        }

        if selector == DeviceSelector::All {
            let returned: BTreeSet<DeviceId> = bundles.iter().map(|b| b.device_id).collect();
            let known = self
                .services
                .recipients
                .recipient(recipient)?
                .map(|record| record.devices)
                .unwrap_or_default();
            let add: Vec<DeviceId> = returned.difference(&known).copied().collect();
            let remove: Vec<DeviceId> = known
                .difference(&returned)
                .copied()
                .filter(|device| Some(*device) != local_device)
                .collect();
            if !add.is_empty() || !remove.is_empty() {
                self.update_devices_and_archive(recipient, &add, &remove)?;
            }
        }
        Ok(())
    }

    /// Encrypt `send.plaintext` for one device with its current session.
    fn encrypt_for_device(
        &self,
        send: &MessageSend,
        device_id: DeviceId,
        sealed: Option<&SealedSenderParameters>,
    ) -> Result<DeviceMessage, SendError> {
        let recipient = &send.recipient;
        let address = recipient.protocol_address(device_id);
        let encrypted = match send.message.kind.encryption_style() {
            EncryptionStyle::Whisper => self.services.sessions.encrypt(&address, &send.plaintext),
            EncryptionStyle::Plaintext => self.plaintext_content(&address, &send.plaintext),
        };
        let ciphertext = match encrypted {
            Ok(ciphertext) => ciphertext,
            Err(CryptoError::IdentityKeyMismatch(_)) => {
                warn!(recipient = %recipient, device_id, "identity key mismatch, archiving session");
                self.services.sessions.archive_session(&address)?;
                return Err(SendError::IdentityKeyMismatch(recipient.clone()));
            }
            Err(CryptoError::UntrustedIdentity(_)) => {
                warn!(recipient = %recipient, device_id, "untrusted identity on outgoing message");
                return Err(SendError::UntrustedIdentity(recipient.clone()));
            }
            Err(error) => return Err(error.into()),
        };

        let session = self
            .services
            .sessions
            .remote_session(&address)?
            .ok_or_else(|| missing_session(recipient, device_id))?;

        let (message_type, content) = match sealed {
            Some(params) => {
                let content = UnidentifiedContent {
                    sender_certificate: params.certificate.clone(),
                    message_type: ciphertext.message_type,
                    contents: ciphertext.body,
                    group_id: send.thread.group_id().map(<[u8]>::to_vec),
                };
                (
                    DeviceMessageType::UnidentifiedSender,
                    sealed_sender::seal(&content, &session.identity_key)?,
                )
            }
            None => (wire_type(ciphertext.message_type)?, ciphertext.body),
        };

        Ok(DeviceMessage {
            message_type,
            destination_device_id: device_id,
            destination_registration_id: session.registration_id,
            content,
        })
    }

    /// Unencrypted content still needs a session: the destination
    /// registration id comes from it.
    fn plaintext_content(
        &self,
        address: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<CiphertextMessage, CryptoError> {
        if !self.services.sessions.has_current_session(address)? {
            return Err(CryptoError::SessionNotFound(address.clone()));
        }
        Ok(CiphertextMessage {
            message_type: CiphertextMessageType::Plaintext,
            body: plaintext.to_vec(),
        })
    }

    /// Apply a device list change, archiving sessions of removed devices.
    pub(crate) fn update_devices_and_archive(
        &self,
        recipient: &ServiceId,
        add: &[DeviceId],
        remove: &[DeviceId],
    ) -> Result<(), SendError> {
        self.services.recipients.update_devices(recipient, add, remove)?;
        for device_id in remove {
            self.services
                .sessions
                .archive_session(&recipient.protocol_address(*device_id))?;
        }
        if !remove.is_empty() {
            info!(recipient = %recipient, devices = ?remove, "archived sessions for removed devices");
        }
        Ok(())
    }
}

fn prekey_fetch_error(error: RelayError) -> SendError {
    match error.status() {
        Some(401) => SendError::InvalidAuthHeader,
        _ => error.into(),
    }
}

fn missing_session(recipient: &ServiceId, device_id: DeviceId) -> SendError {
    SendError::MissingSession {
        recipient: recipient.clone(),
        device_id,
    }
}

fn wire_type(message_type: CiphertextMessageType) -> Result<DeviceMessageType, SendError> {
    match message_type {
        CiphertextMessageType::PreKey => Ok(DeviceMessageType::PrekeyBundle),
        CiphertextMessageType::Whisper => Ok(DeviceMessageType::Ciphertext),
        CiphertextMessageType::Plaintext => Ok(DeviceMessageType::PlaintextContent),
        CiphertextMessageType::SenderKey => Err(SendError::MessageTypeMismatch(
            "sender key ciphertext in a device message".into(),
        )),
    }
}
