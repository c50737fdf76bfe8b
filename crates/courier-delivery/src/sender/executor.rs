//! Submits device messages to the relay and turns its answers into delivery
//! state or corrective actions.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::{RelayError, SendError};
use crate::ids::{Address, ServiceId, ThreadId};
use crate::message::{MessageKind, RecipientState};
use crate::relay::{
    AccountMismatchedDevices, AccountStaleDevices, DeviceMessage, MessageSubmission,
    MismatchedDevices, MultiRecipientSendResponse, MultiRecipientSubmission, RelayAuth,
    StaleDevices,
};
use crate::sender::{MessageSend, MessageSender, SealedSenderParameters, SentDeviceMessage};

impl MessageSender {
    /// Submit one recipient's device messages as a single request.
    pub(crate) async fn submit_device_messages(
        &self,
        send: &MessageSend,
        messages: Vec<DeviceMessage>,
        sealed: Option<&SealedSenderParameters>,
    ) -> Result<Vec<SentDeviceMessage>, SendError> {
        let message = &send.message;
        let submission = MessageSubmission {
            destination: send.recipient.clone(),
            messages,
            timestamp: message.timestamp,
            online: message.is_online(),
            urgent: message.is_urgent,
            story: message.is_story(),
        };
        let auth = sealed.map_or(RelayAuth::Identified, |params| {
            params.relay_auth(message.is_story())
        });
        match self
            .relay_call(self.services.relay.submit_messages(&submission, auth))
            .await
        {
            Ok(()) => self.did_send_device_messages(send, &submission.messages, sealed.is_some()),
            Err(error) => Err(self.did_fail_device_messages(send, error, sealed.is_some()).await),
        }
    }

    fn did_send_device_messages(
        &self,
        send: &MessageSend,
        messages: &[DeviceMessage],
        sealed_sender: bool,
    ) -> Result<Vec<SentDeviceMessage>, SendError> {
        let recipient = &send.recipient;
        let sent: Vec<SentDeviceMessage> = messages
            .iter()
            .map(|m| SentDeviceMessage {
                device_id: m.destination_device_id,
                registration_id: m.destination_registration_id,
            })
            .collect();
        info!(
            recipient = %recipient,
            timestamp = send.message.timestamp,
            kind = send.message.kind.name(),
            devices = sent.len(),
            sealed_sender,
            "sent message"
        );

        if let Some(payload_id) = send.payload_id {
            let devices: Vec<_> = sent.iter().map(|d| d.device_id).collect();
            self.services
                .payloads
                .record_pending_delivery(payload_id, recipient, &devices)?;
        }
        send.tracker.set(vec![(
            Address::Service(recipient.clone()),
            RecipientState::Sent { sealed_sender },
        )])?;
        if matches!(send.message.kind, MessageKind::ResendResponse) {
            self.services
                .hooks
                .did_send_resend_response(recipient, send.message.timestamp, &sent);
        }
        self.services.recipients.did_send_message(recipient)?;
        // Story sends succeed for anyone; they say nothing about registration.
        if !send.message.is_story() {
            self.services.recipients.mark_registered(recipient)?;
        }
        Ok(sent)
    }

    async fn did_fail_device_messages(
        &self,
        send: &MessageSend,
        error: RelayError,
        was_sealed: bool,
    ) -> SendError {
        let recipient = &send.recipient;
        warn!(
            recipient = %recipient,
            timestamp = send.message.timestamp,
            error = %error,
            "message submission failed"
        );
        match error {
            RelayError::Status { status: 401, .. } if was_sealed => SendError::InvalidAuthHeader,
            RelayError::Status { status: 404, .. } => self.handle_404(send).await,
            RelayError::Status {
                status: 409, body, ..
            } => match serde_json::from_slice::<MismatchedDevices>(&body) {
                Ok(mismatched) => self
                    .handle_mismatched_devices(recipient, &mismatched)
                    .err()
                    .unwrap_or(SendError::DeviceUpdate),
                Err(e) => SendError::InvalidResponse(e.to_string()),
            },
            RelayError::Status {
                status: 410, body, ..
            } => match serde_json::from_slice::<StaleDevices>(&body) {
                Ok(stale) => self
                    .handle_stale_devices(recipient, &stale)
                    .err()
                    .unwrap_or(SendError::StaleDevices),
                Err(e) => SendError::InvalidResponse(e.to_string()),
            },
            RelayError::Status {
                status: 428,
                body,
                retry_after,
            } => self.handle_spam_challenge(&body, retry_after).await,
            other => other.into(),
        }
    }

    /// The relay says the recipient has no account.
    ///
    /// Confirmed through the account-existence endpoint unless we are
    /// sending to ourselves. If that endpoint disagrees, the inconsistency
    /// is reported as retryable.
    pub(crate) async fn handle_404(&self, send: &MessageSend) -> SendError {
        if !send.is_self_send() {
            if let Err(error) = self.check_account_exists(&send.recipient).await {
                return error;
            }
        }
        warn!(recipient = %send.recipient, "relay endpoints disagree about account existence");
        SendError::AccountExistenceMismatch(send.recipient.clone())
    }

    /// `Err(NoSuchRecipient)` when the relay confirms there is no account,
    /// in which case the recipient is marked unregistered.
    pub(crate) async fn check_account_exists(&self, recipient: &ServiceId) -> Result<(), SendError> {
        match self
            .relay_call(self.services.relay.check_account_exists(recipient))
            .await
        {
            Ok(()) => Ok(()),
            Err(error) if error.status() == Some(404) => {
                info!(recipient = %recipient, "recipient has no account, marking unregistered");
                self.recent_failures.record_nonexistent_account(recipient);
                self.services.recipients.mark_unregistered(recipient)?;
                Err(SendError::NoSuchRecipient(recipient.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    fn handle_mismatched_devices(
        &self,
        recipient: &ServiceId,
        mismatched: &MismatchedDevices,
    ) -> Result<(), SendError> {
        info!(
            recipient = %recipient,
            missing = ?mismatched.missing_devices,
            extra = ?mismatched.extra_devices,
            "device list changed"
        );
        self.update_devices_and_archive(
            recipient,
            &mismatched.missing_devices,
            &mismatched.extra_devices,
        )
    }

    fn handle_stale_devices(&self, recipient: &ServiceId, stale: &StaleDevices) -> Result<(), SendError> {
        info!(recipient = %recipient, stale = ?stale.stale_devices, "archiving stale sessions");
        for device_id in &stale.stale_devices {
            self.services
                .sessions
                .archive_session(&recipient.protocol_address(*device_id))?;
        }
        Ok(())
    }

    /// Give the challenge resolver a bounded chance to clear a 428.
    async fn handle_spam_challenge(&self, body: &[u8], retry_after: Option<Duration>) -> SendError {
        let resolved = tokio::time::timeout(
            self.config.spam_challenge_timeout,
            self.services
                .spam_challenges
                .try_handle_silently(body, retry_after),
        )
        .await
        .unwrap_or(false);
        if resolved {
            info!("spam challenge resolved silently");
            SendError::SpamChallengeResolved
        } else {
            warn!("spam challenge needs user action");
            SendError::SpamChallengeRequired
        }
    }

    // ── Multi-recipient submissions ──

    /// Submit a sealed multi-recipient payload. Corrective state (device
    /// lists, stale sessions, key delivery records) is applied before the
    /// error is returned.
    pub(crate) async fn submit_multi_recipient(
        &self,
        thread: &ThreadId,
        submission: &MultiRecipientSubmission,
    ) -> Result<MultiRecipientSendResponse, SendError> {
        match self
            .relay_call(self.services.relay.submit_multi_recipient(submission))
            .await
        {
            Ok(response) => Ok(response),
            Err(error) => {
                warn!(
                    thread = %thread,
                    timestamp = submission.timestamp,
                    error = %error,
                    "multi-recipient submission failed"
                );
                Err(self.did_fail_multi_recipient(thread, error).await)
            }
        }
    }

    async fn did_fail_multi_recipient(&self, thread: &ThreadId, error: RelayError) -> SendError {
        match error {
            RelayError::Status { status: 401, .. } => SendError::InvalidAuthHeader,
            RelayError::Status { status: 404, .. } => SendError::InvalidRecipient,
            RelayError::Status {
                status: 409, body, ..
            } => match serde_json::from_slice::<Vec<AccountMismatchedDevices>>(&body) {
                Ok(accounts) => accounts
                    .iter()
                    .find_map(|account| {
                        self.handle_mismatched_devices(&account.uuid, &account.devices)
                            .err()
                    })
                    .unwrap_or(SendError::DeviceUpdate),
                Err(e) => SendError::InvalidResponse(e.to_string()),
            },
            RelayError::Status {
                status: 410, body, ..
            } => match serde_json::from_slice::<Vec<AccountStaleDevices>>(&body) {
                Ok(accounts) => accounts
                    .iter()
                    .find_map(|account| {
                        self.handle_stale_devices(&account.uuid, &account.devices)
                            .and_then(|()| {
                                self.services
                                    .sender_keys
                                    .reset_delivery_record(thread, &account.uuid)
                                    .map_err(SendError::from)
                            })
                            .err()
                    })
                    .unwrap_or(SendError::StaleDevices),
                Err(e) => SendError::InvalidResponse(e.to_string()),
            },
            RelayError::Status {
                status: 428,
                body,
                retry_after,
            } => self.handle_spam_challenge(&body, retry_after).await,
            other => other.into(),
        }
    }
}
