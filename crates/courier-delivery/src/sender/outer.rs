//! Whole-message delivery: recipient resolution, the sender-key/fanout
//! split, and one-shot recovery by re-running the send.

use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use tracing::{debug, error, info, warn};

use crate::error::SendError;
use crate::ids::{Address, ServiceId};
use crate::message::{MessageKind, OutgoingMessage, RecipientState};
use crate::recovery::{OuterRecoveryReason, OuterRecoveryState, RecoveryReason};
use crate::sender::{
    DeliveryTracker, MessageSender, SendContext, SendMessageFailure, SendResult,
};
use crate::thread::Thread;

enum AttemptOutcome {
    Finished(SendResult),
    /// Corrective state was applied; run the whole send again.
    Retry(OuterRecoveryReason),
}

impl MessageSender {
    /// Deliver `message` to every recipient still owed it.
    ///
    /// Recipient states are updated as deliveries land (and persisted for
    /// saved messages). The result says whether the caller's job should
    /// consider the message sent.
    pub async fn send_message(&self, message: &OutgoingMessage) -> SendResult {
        let _pending = self.pending.begin();
        let message = Arc::new(message.clone());
        let tracker = Arc::new(DeliveryTracker::new(
            &message,
            Arc::clone(&self.services.messages),
        ));
        info!(
            timestamp = message.timestamp,
            kind = message.kind.name(),
            thread = %message.thread_id,
            "sending message"
        );

        let mut result = match self.prepare_send(&message, &tracker).await {
            Ok(()) => self.send_with_recovery(&message, &tracker).await,
            Err(error) => SendResult::OverallFailure(error),
        };

        if result.is_success() || tracker.sent_count() > 0 {
            if let Err(error) = self.handle_sent_locally(&message, &tracker).await {
                warn!(timestamp = message.timestamp, error = %error, "post-send bookkeeping failed");
                if result.is_success() {
                    result = SendResult::OverallFailure(error);
                }
            }
        }
        if let SendResult::OverallFailure(error) = &result {
            let updates = tracker
                .sending()
                .into_iter()
                .map(|address| (address, error))
                .collect::<Vec<_>>();
            if let Err(store_error) = record_failures(&tracker, updates) {
                warn!(error = %store_error, "could not record send failure");
            }
        }

        match &result {
            SendResult::Success => {
                info!(timestamp = message.timestamp, sent = tracker.sent_count(), "message sent");
            }
            failure => {
                warn!(
                    timestamp = message.timestamp,
                    sent = tracker.sent_count(),
                    error = ?failure.error(),
                    "message send failed"
                );
            }
        }
        result
    }

    /// Everything that must hold before any recipient is contacted.
    async fn prepare_send(
        &self,
        message: &OutgoingMessage,
        tracker: &DeliveryTracker,
    ) -> Result<(), SendError> {
        let restart: Vec<_> = tracker
            .snapshot()
            .into_iter()
            .filter(|(_, state)| matches!(state, RecipientState::Pending | RecipientState::Failed { .. }))
            .map(|(address, _)| (address, RecipientState::Sending))
            .collect();
        tracker.set(restart)?;

        try_join_all(
            message
                .attachments
                .iter()
                .map(|attachment| self.services.attachments.upload(attachment)),
        )
        .await?;
        if self.services.account.is_app_expired() {
            return Err(SendError::AppExpired);
        }
        if !self.services.account.is_registered() {
            return Err(SendError::NotRegistered);
        }
        if message.should_be_saved && self.services.messages.is_deleted(message.timestamp)? {
            info!(timestamp = message.timestamp, "message deleted before it was sent");
            return Err(SendError::MessageDeletedBeforeSent);
        }
        Ok(())
    }

    async fn send_with_recovery(
        &self,
        message: &Arc<OutgoingMessage>,
        tracker: &Arc<DeliveryTracker>,
    ) -> SendResult {
        let mut recovery = OuterRecoveryState::new();
        loop {
            match self.attempt_send(message, tracker, recovery).await {
                Ok(AttemptOutcome::Finished(result)) => return result,
                Ok(AttemptOutcome::Retry(reason)) => match recovery.consume(reason) {
                    Ok(next) => {
                        info!(timestamp = message.timestamp, reason = reason.name(), "retrying whole send");
                        recovery = next;
                    }
                    Err(error) => {
                        // Only reachable if a correction failed to stop the
                        // failure it was applied for.
                        error!(timestamp = message.timestamp, reason = reason.name(), "recovery already used");
                        return SendResult::OverallFailure(error);
                    }
                },
                Err(error) => return SendResult::OverallFailure(error),
            }
        }
    }

    async fn attempt_send(
        &self,
        message: &Arc<OutgoingMessage>,
        tracker: &Arc<DeliveryTracker>,
        recovery: OuterRecoveryState,
    ) -> Result<AttemptOutcome, SendError> {
        let thread = self
            .services
            .threads
            .thread(&message.thread_id)?
            .ok_or(SendError::ThreadMissing)?;
        if !thread.can_send(message.kind) {
            if message.should_be_saved {
                return Err(SendError::ThreadNotSendable);
            }
            debug!(timestamp = message.timestamp, "thread does not accept message, dropping it");
            return Ok(AttemptOutcome::Finished(SendResult::Success));
        }
        let local = self
            .services
            .account
            .local_account()
            .ok_or(SendError::NotRegistered)?;

        let proposed = self.proposed_recipients(message, &thread, &local, tracker)?;
        if !proposed.phone_numbers.is_empty()
            && recovery.can(OuterRecoveryReason::PhoneNumberLookup)
        {
            self.look_up_phone_numbers(&proposed.phone_numbers).await?;
            return Ok(AttemptOutcome::Retry(OuterRecoveryReason::PhoneNumberLookup));
        }
        mark_skipped_recipients(tracker, &proposed.service_ids)?;

        if let Thread::Contact { contact, .. } = &thread {
            if local.is_local(contact) && !message.kind.can_send_to_self() {
                // Our other devices get this through the sync transcript.
                debug!(timestamp = message.timestamp, "note to self, nothing to transmit");
                return Ok(AttemptOutcome::Finished(SendResult::Success));
            }
        }
        if proposed.service_ids.is_empty() {
            debug!(timestamp = message.timestamp, "no recipients left to send to");
            return Ok(AttemptOutcome::Finished(SendResult::Success));
        }

        let payload_id = if message.kind.records_payload() {
            Some(self.services.payloads.record_payload(
                &message.thread_id,
                message.timestamp,
                &message.content,
                message.is_urgent,
            )?)
        } else {
            None
        };
        let certificate = if message.kind.allows_sealed_sender() {
            self.services.account.sender_certificate()
        } else {
            None
        };
        let context = SendContext {
            message: Arc::clone(message),
            thread: Arc::new(thread),
            local,
            tracker: Arc::clone(tracker),
            payload_id,
            certificate,
        };

        let recipient_errors = self.deliver(&context, &proposed.service_ids, recovery).await?;
        if recipient_errors.is_empty() {
            return Ok(AttemptOutcome::Finished(SendResult::Success));
        }
        let failure = SendMessageFailure { recipient_errors };
        if let Some(reason) = retry_reason(&failure) {
            // Keep failed recipients in `Sending` so the retry picks them up.
            let skipped = skipped_recipients(&context.thread, &failure);
            mark_skipped(tracker, skipped)?;
            return Ok(AttemptOutcome::Retry(reason));
        }
        handle_send_failure(&context.thread, tracker, failure).map(AttemptOutcome::Finished)
    }

    /// Sender-key multicast and per-recipient fanout, run concurrently.
    /// Returns the recipients that did not get the message.
    async fn deliver(
        &self,
        context: &SendContext,
        recipients: &[ServiceId],
        recovery: OuterRecoveryState,
    ) -> Result<Vec<(ServiceId, SendError)>, SendError> {
        let plan = self.plan_sender_key_send(context, recipients, recovery)?;
        let mut fanout = Vec::new();
        for recipient in recipients {
            if plan.recipients.contains(recipient) {
                continue;
            }
            let send = context.send_to(recipient.clone());
            let sealed = self.sealed_sender_parameters(&send, context.certificate.as_ref())?;
            fanout.push((send, sealed));
        }
        let fanout = fanout.into_iter().map(|(send, sealed)| async move {
            self.perform_message_send(&send, sealed)
                .await
                .err()
                .map(|error| (send.recipient, error))
        });
        let (mut recipient_errors, fanout_errors) =
            futures::join!(self.send_via_sender_key(plan), join_all(fanout));
        recipient_errors.extend(fanout_errors.into_iter().flatten());
        Ok(recipient_errors)
    }

    async fn look_up_phone_numbers(&self, phone_numbers: &[String]) -> Result<(), SendError> {
        let found = self.services.phone_numbers.lookup(phone_numbers).await?;
        info!(requested = phone_numbers.len(), found = found.len(), "looked up phone numbers");
        for (phone_number, service_id) in &found {
            self.services
                .recipients
                .link_phone_number(phone_number, service_id)?;
        }
        Ok(())
    }

    /// Local effects of a message that reached at least one recipient.
    async fn handle_sent_locally(
        &self,
        message: &OutgoingMessage,
        tracker: &DeliveryTracker,
    ) -> Result<(), SendError> {
        let Some(thread) = self.services.threads.thread(&message.thread_id)? else {
            return Ok(());
        };
        let local = self.services.account.local_account();
        let note_to_self = match (&thread, &local) {
            (Thread::Contact { contact, .. }, Some(local)) => local.is_local(contact),
            _ => false,
        };

        if message.kind.unhides_recipient() && !note_to_self {
            if let Thread::Contact {
                contact: Address::Service(contact),
                ..
            } = &thread
            {
                self.services.recipients.unhide(contact)?;
            }
        }

        if message.kind.needs_sync_transcript() {
            self.services.sync_transcripts.send_transcript(message).await?;
            if message.should_be_saved {
                self.services.messages.mark_transcript_synced(message.timestamp)?;
            }
            debug!(timestamp = message.timestamp, "sent sync transcript");
        }

        if note_to_self && !message.kind.can_send_to_self() {
            if let Some(local) = &local {
                tracker.set(vec![(
                    local.address(),
                    RecipientState::Sent {
                        sealed_sender: false,
                    },
                )])?;
            }
            if message.should_be_saved {
                let viewed = matches!(
                    message.kind,
                    MessageKind::Data { is_voice: true, .. }
                        | MessageKind::Data {
                            is_view_once: true,
                            ..
                        }
                );
                self.services
                    .messages
                    .mark_read_locally(message.timestamp, viewed)?;
            }
        }
        Ok(())
    }
}

/// Recipients still `Sending` that this attempt will not target.
fn mark_skipped_recipients(tracker: &DeliveryTracker, targets: &[ServiceId]) -> Result<(), SendError> {
    let skipped: Vec<Address> = tracker
        .sending()
        .into_iter()
        .filter(|address| !address.service_id().is_some_and(|sid| targets.contains(sid)))
        .collect();
    for address in &skipped {
        debug!(recipient = %address, "skipping recipient");
    }
    mark_skipped(tracker, skipped)
}

fn handle_send_failure(
    thread: &Thread,
    tracker: &DeliveryTracker,
    failure: SendMessageFailure,
) -> Result<SendResult, SendError> {
    mark_skipped(tracker, skipped_recipients(thread, &failure))?;
    let remaining: Vec<(ServiceId, SendError)> = failure
        .recipient_errors
        .into_iter()
        .filter(|(_, error)| thread.is_contact() || !matches!(error, SendError::NoSuchRecipient(_)))
        .collect();
    record_failures(
        tracker,
        remaining
            .iter()
            .map(|(recipient, error)| (Address::Service(recipient.clone()), error))
            .collect(),
    )?;

    if remaining.is_empty() {
        if tracker.sent_count() == 0 {
            return Err(SendError::NoValidRecipients);
        }
        return Ok(SendResult::Success);
    }
    Ok(SendResult::RecipientsFailure(SendMessageFailure {
        recipient_errors: remaining,
    }))
}

/// The recovery a failed attempt calls for, most disruptive first.
fn retry_reason(failure: &SendMessageFailure) -> Option<OuterRecoveryReason> {
    if failure.contains(|e| matches!(e, SendError::InvalidAuthHeader | SendError::InvalidRecipient)) {
        Some(OuterRecoveryReason::MultiRecipientSealedSender)
    } else if failure.contains(|e| matches!(e, SendError::DeviceUpdate)) {
        Some(OuterRecoveryReason::MismatchedDevices)
    } else if failure.contains(|e| matches!(e, SendError::StaleDevices)) {
        Some(OuterRecoveryReason::StaleDevices)
    } else {
        None
    }
}

/// Group and broadcast members without an account are skipped rather than
/// failed.
fn skipped_recipients(thread: &Thread, failure: &SendMessageFailure) -> Vec<Address> {
    if thread.is_contact() {
        return Vec::new();
    }
    failure
        .recipient_errors
        .iter()
        .filter(|(_, error)| matches!(error, SendError::NoSuchRecipient(_)))
        .map(|(recipient, _)| Address::Service(recipient.clone()))
        .collect()
}

fn mark_skipped(tracker: &DeliveryTracker, addresses: Vec<Address>) -> Result<(), SendError> {
    tracker.set(
        addresses
            .into_iter()
            .map(|address| (address, RecipientState::Skipped))
            .collect(),
    )
}

/// Record each recipient's failure. Retryable errors leave the recipient
/// `Sending` for the next attempt. An unresolved spam challenge parks it as
/// `Pending`; anything else marks it `Failed`.
fn record_failures(
    tracker: &DeliveryTracker,
    failures: Vec<(Address, &SendError)>,
) -> Result<(), SendError> {
    let updates = failures
        .into_iter()
        .filter_map(|(address, error)| {
            if error.is_retryable() && tracker.state(&address) == Some(RecipientState::Sending) {
                return None;
            }
            let state = if matches!(error, SendError::SpamChallengeRequired) {
                RecipientState::Pending
            } else {
                RecipientState::Failed {
                    error: error.to_string(),
                }
            };
            Some((address, state))
        })
        .collect();
    tracker.set(updates)
}
