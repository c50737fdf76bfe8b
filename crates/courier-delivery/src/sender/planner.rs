//! Splits a group send between one sender-key multicast and per-recipient
//! fanout, and runs the multicast half.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use courier_crypto::sealed_sender::{self, MultiRecipientDevice, REGISTRATION_ID_MASK};
use courier_crypto::signal::CiphertextMessageType;
use courier_crypto::{AccessKey, SenderCertificate, UnidentifiedContent};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::SendError;
use crate::ids::{Address, ServiceId, ThreadId};
use crate::message::{MessageKind, OutgoingMessage, RecipientState};
use crate::recovery::{OuterRecoveryReason, OuterRecoveryState};
use crate::relay::MultiRecipientSubmission;
use crate::sender::{
    DeliveryTracker, MessageSend, MessageSender, SealedSenderParameters, SendContext,
};
use crate::store::KeyRecipientDevice;
use crate::thread::Thread;

/// Which recipients go through the multicast; everyone else is fanned out.
pub(crate) struct SenderKeyPlan {
    pub recipients: BTreeSet<ServiceId>,
    multicast: Option<Multicast>,
}

impl SenderKeyPlan {
    fn fanout_only() -> Self {
        Self {
            recipients: BTreeSet::new(),
            multicast: None,
        }
    }
}

struct Multicast {
    context: SendContext,
    certificate: SenderCertificate,
    access_keys: HashMap<ServiceId, AccessKey>,
    /// Recipients already holding the current key on all their devices.
    ready: BTreeSet<ServiceId>,
    /// Distribution messages for everyone else, sent before the multicast.
    distributions: Vec<MessageSend>,
}

/// A recipient the multicast could reach.
struct Candidate {
    access_key: Option<AccessKey>,
    /// `None` while some device still has no session.
    devices: Option<BTreeSet<KeyRecipientDevice>>,
}

impl MessageSender {
    pub(crate) fn plan_sender_key_send(
        &self,
        context: &SendContext,
        recipients: &[ServiceId],
        recovery: OuterRecoveryState,
    ) -> Result<SenderKeyPlan, SendError> {
        let message = &context.message;
        let Thread::Group(group) = context.thread.as_ref() else {
            return Ok(SenderKeyPlan::fanout_only());
        };
        if !group.uses_sender_key
            || !message.kind.allows_sender_key()
            || !recovery.can(OuterRecoveryReason::MultiRecipientSealedSender)
        {
            return Ok(SenderKeyPlan::fanout_only());
        }
        let Some(certificate) = context.certificate.clone() else {
            debug!(thread = %group.id, "no sender certificate, using fanout");
            return Ok(SenderKeyPlan::fanout_only());
        };
        if message.content.len() > self.config.max_sender_key_envelope_size {
            debug!(thread = %group.id, size = message.content.len(), "message too large for sender key");
            return Ok(SenderKeyPlan::fanout_only());
        }

        let members: BTreeSet<ServiceId> = group
            .members
            .iter()
            .filter_map(Address::service_id)
            .cloned()
            .collect();
        self.services.sender_keys.expire_if_necessary(
            &group.id,
            self.config.max_sender_key_age,
            &members,
        )?;

        let mut eligible = BTreeSet::new();
        let mut access_keys = HashMap::new();
        let mut key_devices = HashMap::new();
        for recipient in recipients {
            if *recipient == context.local.service_id || !members.contains(recipient) {
                continue;
            }
            let Some(candidate) = self.sender_key_candidate(recipient, message.is_story())? else {
                continue;
            };
            eligible.insert(recipient.clone());
            if let Some(access_key) = candidate.access_key {
                access_keys.insert(recipient.clone(), access_key);
            }
            if let Some(devices) = candidate.devices {
                key_devices.insert(recipient.clone(), devices);
            }
        }
        if eligible.len() < self.config.sender_key_min_recipients {
            debug!(thread = %group.id, eligible = eligible.len(), "too few sender key recipients, using fanout");
            return Ok(SenderKeyPlan::fanout_only());
        }

        let holding = self
            .services
            .sender_keys
            .ready_recipients(&group.id, &key_devices)?;
        let (ready, needs_key): (BTreeSet<_>, BTreeSet<_>) = eligible
            .iter()
            .cloned()
            .partition(|recipient| holding.contains(recipient));
        let distributions = self.distribution_sends(context, &group.id, needs_key)?;
        info!(
            thread = %group.id,
            timestamp = message.timestamp,
            ready = ready.len(),
            needs_key = distributions.len(),
            "sending with sender key"
        );

        Ok(SenderKeyPlan {
            recipients: eligible,
            multicast: Some(Multicast {
                context: context.clone(),
                certificate,
                access_keys,
                ready,
                distributions,
            }),
        })
    }

    fn sender_key_candidate(
        &self,
        recipient: &ServiceId,
        is_story: bool,
    ) -> Result<Option<Candidate>, SendError> {
        let Some(record) = self.services.recipients.recipient(recipient)? else {
            return Ok(None);
        };
        if !record.is_registered || record.devices.is_empty() {
            return Ok(None);
        }
        if record.access_key.is_none() && !is_story {
            return Ok(None);
        }

        let mut devices = BTreeSet::new();
        let mut complete = true;
        for &device_id in &record.devices {
            match self
                .services
                .sessions
                .remote_session(&recipient.protocol_address(device_id))?
            {
                Some(session) if session.registration_id & !REGISTRATION_ID_MASK != 0 => {
                    debug!(recipient = %recipient, device_id, "registration id out of range for sender key");
                    return Ok(None);
                }
                Some(session) => {
                    devices.insert(KeyRecipientDevice {
                        device_id,
                        registration_id: session.registration_id,
                    });
                }
                None => complete = false,
            }
        }
        Ok(Some(Candidate {
            access_key: record.access_key,
            devices: complete.then_some(devices),
        }))
    }

    fn distribution_sends(
        &self,
        context: &SendContext,
        thread: &ThreadId,
        recipients: BTreeSet<ServiceId>,
    ) -> Result<Vec<MessageSend>, SendError> {
        if recipients.is_empty() {
            return Ok(Vec::new());
        }
        let skdm = self.services.sender_keys.skdm_bytes(thread)?;
        let message = Arc::new(OutgoingMessage::new(
            self.services.clock.now_ms(),
            thread.clone(),
            MessageKind::SenderKeyDistribution {
                on_behalf_of: context.message.timestamp,
                for_online_message: context.message.is_online(),
            },
            skdm,
        ));
        let tracker = Arc::new(DeliveryTracker::new(
            &message,
            Arc::clone(&self.services.messages),
        ));
        Ok(recipients
            .into_iter()
            .map(|recipient| {
                MessageSend::new(
                    Arc::clone(&message),
                    Arc::clone(&context.thread),
                    recipient,
                    context.local.clone(),
                    Arc::clone(&tracker),
                )
            })
            .collect())
    }

    // ── Execution ──

    /// Distribute the key where needed, then multicast. Returns the
    /// recipients that did not get the message.
    pub(crate) async fn send_via_sender_key(
        &self,
        plan: SenderKeyPlan,
    ) -> Vec<(ServiceId, SendError)> {
        let Some(multicast) = plan.multicast else {
            return Vec::new();
        };
        let thread = multicast.context.thread.id();
        let mut ready = multicast.ready.clone();
        let mut failures = Vec::new();

        if !multicast.distributions.is_empty() {
            let (delivered, distribution_failures) =
                self.send_distribution_messages(&multicast).await;
            failures.extend(distribution_failures);
            if let Err(error) = self
                .services
                .sender_keys
                .record_sent_sender_keys(thread, &delivered)
            {
                let error = SendError::from(error);
                failures.extend(
                    ready
                        .into_iter()
                        .chain(delivered.into_keys())
                        .map(|recipient| (recipient, error.clone())),
                );
                return failures;
            }
            ready.extend(delivered.into_keys());
        }

        if !ready.is_empty() {
            failures.extend(self.multicast_to(&multicast, ready).await);
        }
        failures
    }

    async fn send_distribution_messages(
        &self,
        multicast: &Multicast,
    ) -> (
        HashMap<ServiceId, BTreeSet<KeyRecipientDevice>>,
        Vec<(ServiceId, SendError)>,
    ) {
        let sends = multicast.distributions.iter().map(|send| async move {
            let sealed = multicast
                .access_keys
                .get(&send.recipient)
                .map(|access_key| SealedSenderParameters {
                    certificate: multicast.certificate.clone(),
                    access_key: Some(*access_key),
                });
            let result = self.perform_message_send(send, sealed).await;
            (send.recipient.clone(), result)
        });

        let mut delivered = HashMap::new();
        let mut failures = Vec::new();
        for (recipient, result) in join_all(sends).await {
            match result {
                Ok(sent) => {
                    let devices = sent
                        .iter()
                        .map(|device| KeyRecipientDevice {
                            device_id: device.device_id,
                            registration_id: device.registration_id,
                        })
                        .collect();
                    delivered.insert(recipient, devices);
                }
                Err(error) => {
                    warn!(recipient = %recipient, error = %error, "sender key distribution failed");
                    failures.push((recipient, error));
                }
            }
        }
        (delivered, failures)
    }

    async fn multicast_to(
        &self,
        multicast: &Multicast,
        ready: BTreeSet<ServiceId>,
    ) -> Vec<(ServiceId, SendError)> {
        let context = &multicast.context;
        let thread = context.thread.id();
        let mut failures = Vec::new();
        let confirmed = self.confirm_key_holders(thread, ready, &mut failures);
        if confirmed.is_empty() {
            return failures;
        }
        let devices: Vec<MultiRecipientDevice> = confirmed
            .iter()
            .flat_map(|(_, recipient_devices)| recipient_devices.iter().cloned())
            .collect();
        let confirmed: Vec<(ServiceId, BTreeSet<KeyRecipientDevice>)> = confirmed
            .into_iter()
            .map(|(recipient, recipient_devices)| (recipient, key_devices_of(&recipient_devices)))
            .collect();

        let payload = match self.seal_for_multicast(multicast, &devices) {
            Ok(payload) => payload,
            Err(error) => {
                failures.extend(confirmed.into_iter().map(|(r, _)| (r, error.clone())));
                return failures;
            }
        };
        let message = &context.message;
        let access_key = (!message.is_story()).then(|| {
            AccessKey::combine(
                confirmed
                    .iter()
                    .filter_map(|(recipient, _)| multicast.access_keys.get(recipient)),
            )
        });
        let submission = MultiRecipientSubmission {
            payload,
            access_key,
            timestamp: message.timestamp,
            online: message.is_online(),
            urgent: message.is_urgent,
            story: message.is_story(),
        };

        let mut response = self.submit_multi_recipient(thread, &submission).await;
        if matches!(response, Err(SendError::SpamChallengeResolved)) {
            response = self.submit_multi_recipient(thread, &submission).await;
        }
        match response {
            Ok(response) => {
                info!(
                    thread = %thread,
                    timestamp = message.timestamp,
                    recipients = confirmed.len(),
                    unregistered = response.unregistered.len(),
                    "sent multi-recipient message"
                );
                for (recipient, recipient_devices) in confirmed {
                    let result = if response.unregistered.contains(&recipient) {
                        self.mark_multicast_unregistered(&recipient)
                    } else {
                        self.did_multicast_to(context, &recipient, &recipient_devices)
                    };
                    if let Err(error) = result {
                        failures.push((recipient, error));
                    }
                }
            }
            Err(error) => {
                failures.extend(confirmed.into_iter().map(|(r, _)| (r, error.clone())));
            }
        }
        failures
    }

    /// Recipients whose current devices all still hold the key, with those
    /// devices. Device lists may have moved while distribution messages
    /// were out; anyone who no longer matches is reported in `failures`.
    fn confirm_key_holders(
        &self,
        thread: &ThreadId,
        ready: BTreeSet<ServiceId>,
        failures: &mut Vec<(ServiceId, SendError)>,
    ) -> Vec<(ServiceId, Vec<MultiRecipientDevice>)> {
        let mut candidates = HashMap::new();
        for recipient in ready {
            match self.multicast_devices(&recipient) {
                Ok(Some(recipient_devices)) => {
                    candidates.insert(recipient, recipient_devices);
                }
                Ok(None) => failures.push((recipient, SendError::DeviceUpdate)),
                Err(error) => failures.push((recipient, error)),
            }
        }
        let key_devices: HashMap<ServiceId, BTreeSet<KeyRecipientDevice>> = candidates
            .iter()
            .map(|(recipient, recipient_devices)| {
                (recipient.clone(), key_devices_of(recipient_devices))
            })
            .collect();
        let holding = match self
            .services
            .sender_keys
            .ready_recipients(thread, &key_devices)
        {
            Ok(holding) => holding,
            Err(error) => {
                let error = SendError::from(error);
                failures.extend(candidates.into_keys().map(|r| (r, error.clone())));
                return Vec::new();
            }
        };

        let mut confirmed = Vec::new();
        for (recipient, recipient_devices) in candidates {
            if holding.contains(&recipient) {
                confirmed.push((recipient, recipient_devices));
            } else {
                info!(recipient = %recipient, "sender key no longer matches devices");
                failures.push((recipient, SendError::DeviceUpdate));
            }
        }
        confirmed
    }

    /// Every device of `recipient` with its session, or `None` if any device
    /// lacks one or the recipient is gone. A session established by the
    /// distribution message may carry a registration id the multi-recipient
    /// format cannot hold; that recipient fails with `InvalidRecipient` so
    /// the retry fans it out.
    fn multicast_devices(
        &self,
        recipient: &ServiceId,
    ) -> Result<Option<Vec<MultiRecipientDevice>>, SendError> {
        let Some(record) = self.services.recipients.recipient(recipient)? else {
            return Ok(None);
        };
        if !record.is_registered || record.devices.is_empty() {
            return Ok(None);
        }
        let mut devices = Vec::with_capacity(record.devices.len());
        for device_id in record.devices {
            let address = recipient.protocol_address(device_id);
            let Some(session) = self.services.sessions.remote_session(&address)? else {
                return Ok(None);
            };
            if session.registration_id & !REGISTRATION_ID_MASK != 0 {
                info!(
                    recipient = %recipient,
                    device_id,
                    registration_id = session.registration_id,
                    "registration id out of range, leaving recipient out of multicast"
                );
                return Err(SendError::InvalidRecipient);
            }
            devices.push(MultiRecipientDevice {
                address,
                registration_id: session.registration_id,
                identity_key: session.identity_key,
            });
        }
        Ok(Some(devices))
    }

    fn seal_for_multicast(
        &self,
        multicast: &Multicast,
        devices: &[MultiRecipientDevice],
    ) -> Result<Vec<u8>, SendError> {
        let context = &multicast.context;
        let ciphertext = self
            .services
            .sender_keys
            .group_encrypt(context.thread.id(), &context.message.content)?;
        let content = UnidentifiedContent {
            sender_certificate: multicast.certificate.clone(),
            message_type: CiphertextMessageType::SenderKey,
            contents: ciphertext,
            group_id: context.thread.group_id().map(<[u8]>::to_vec),
        };
        Ok(sealed_sender::seal_multi_recipient(&content, devices)?)
    }

    fn did_multicast_to(
        &self,
        context: &SendContext,
        recipient: &ServiceId,
        devices: &BTreeSet<KeyRecipientDevice>,
    ) -> Result<(), SendError> {
        if let Some(payload_id) = context.payload_id {
            let device_ids: Vec<_> = devices.iter().map(|d| d.device_id).collect();
            self.services
                .payloads
                .record_pending_delivery(payload_id, recipient, &device_ids)?;
        }
        context.tracker.set(vec![(
            Address::Service(recipient.clone()),
            RecipientState::Sent {
                sealed_sender: true,
            },
        )])?;
        self.services.recipients.did_send_message(recipient)?;
        if !context.message.is_story() {
            self.services.recipients.mark_registered(recipient)?;
        }
        Ok(())
    }

    fn mark_multicast_unregistered(&self, recipient: &ServiceId) -> Result<(), SendError> {
        info!(recipient = %recipient, "multicast recipient has no account");
        self.recent_failures.record_nonexistent_account(recipient);
        self.services.recipients.mark_unregistered(recipient)?;
        Err(SendError::NoSuchRecipient(recipient.clone()))
    }
}

fn key_devices_of(devices: &[MultiRecipientDevice]) -> BTreeSet<KeyRecipientDevice> {
    devices
        .iter()
        .map(|device| KeyRecipientDevice {
            device_id: device.address.device_id(),
            registration_id: device.registration_id,
        })
        .collect()
}
