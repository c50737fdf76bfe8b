//! Delivery of one message to every device of one recipient, with one-shot
//! recovery from device-list and session corrections.

use tracing::{debug, error, info, warn};

use crate::error::SendError;
use crate::ids::Address;
use crate::message::RecipientState;
use crate::recovery::{InnerRecoveryReason, InnerRecoveryState, RecoveryReason};
use crate::relay::DeviceMessageType;
use crate::sender::{MessageSend, MessageSender, SealedSenderParameters, SentDeviceMessage};

impl MessageSender {
    /// Encrypt for and submit to every device of `send.recipient`.
    ///
    /// Sends to one recipient are serialized. Each correctable failure is
    /// retried at most once; a rejected sealed-sender credential drops
    /// to an identified send.
    pub async fn perform_message_send(
        &self,
        send: &MessageSend,
        sealed: Option<SealedSenderParameters>,
    ) -> Result<Vec<SentDeviceMessage>, SendError> {
        let _serialized = self.lock_recipient(&send.recipient).await;

        let mut sealed = sealed;
        let mut recovery = InnerRecoveryState::new();
        loop {
            let error = match self.attempt_message_send(send, sealed.as_ref()).await {
                Ok(sent) => return Ok(sent),
                Err(error) => error,
            };
            let reason = match error {
                SendError::InvalidAuthHeader if sealed.is_some() => {
                    warn!(recipient = %send.recipient, "sealed sender rejected, retrying identified");
                    sealed = None;
                    continue;
                }
                SendError::DeviceUpdate => InnerRecoveryReason::MismatchedDevices,
                // The mismatched session was archived; a fresh one is fetched
                // just like for a stale device.
                SendError::StaleDevices | SendError::IdentityKeyMismatch(_) => {
                    InnerRecoveryReason::StaleDevices
                }
                SendError::SpamChallengeResolved => InnerRecoveryReason::Captcha,
                _ => return Err(error),
            };
            match recovery.consume(reason) {
                Ok(next) => recovery = next,
                Err(_) => {
                    warn!(recipient = %send.recipient, reason = reason.name(), "recovery already used");
                    return Err(error);
                }
            }
            debug!(
                recipient = %send.recipient,
                timestamp = send.message.timestamp,
                reason = reason.name(),
                "retrying send"
            );
        }
    }

    async fn attempt_message_send(
        &self,
        send: &MessageSend,
        sealed: Option<&SealedSenderParameters>,
    ) -> Result<Vec<SentDeviceMessage>, SendError> {
        let recipient = &send.recipient;
        let mut messages = self.build_device_messages(send, sealed).await?;

        if messages.is_empty() {
            if send.is_self_send() {
                // No other devices of our own to deliver to.
                info!(timestamp = send.message.timestamp, "no linked devices, skipping self send");
                send.tracker.set(vec![(
                    Address::Service(recipient.clone()),
                    RecipientState::Skipped,
                )])?;
                return Ok(Vec::new());
            }
            if !send.thread.is_contact() && self.recent_failures.is_known_nonexistent(recipient) {
                debug!(recipient = %recipient, "recipient recently confirmed missing");
                return Err(SendError::NoSuchRecipient(recipient.clone()));
            }
            // We may simply not know the recipient's devices yet.
            self.check_account_exists(recipient).await?;
            self.services.recipients.mark_registered(recipient)?;
            messages = self.build_device_messages(send, sealed).await?;
        }

        for message in &messages {
            let expected_sealed = message.message_type == DeviceMessageType::UnidentifiedSender;
            if expected_sealed != sealed.is_some() {
                error!(
                    recipient = %recipient,
                    device_id = message.destination_device_id,
                    message_type = ?message.message_type,
                    sealed = sealed.is_some(),
                    "device message type does not match sender mode"
                );
                return Err(SendError::MessageTypeMismatch(format!(
                    "{:?} for {recipient}.{}",
                    message.message_type, message.destination_device_id
                )));
            }
        }

        self.submit_device_messages(send, messages, sealed).await
    }
}
