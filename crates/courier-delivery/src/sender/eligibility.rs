use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::SendError;
use crate::ids::{Address, LocalAccount, ServiceId};
use crate::message::{MessageKind, OutgoingMessage};
use crate::sender::{DeliveryTracker, MessageSender};
use crate::thread::Thread;

/// Addresses a send attempt targets, split by whether they can be
/// encrypted for yet.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ProposedRecipients {
    pub service_ids: Vec<ServiceId>,
    /// Phone numbers with no known service id.
    pub phone_numbers: Vec<String>,
}

impl MessageSender {
    /// Who this attempt should deliver to: recipients still being sent to
    /// that remain valid targets of the thread.
    pub(crate) fn proposed_recipients(
        &self,
        message: &OutgoingMessage,
        thread: &Thread,
        local: &LocalAccount,
        tracker: &DeliveryTracker,
    ) -> Result<ProposedRecipients, SendError> {
        let proposed = self.proposed_addresses(message, thread, local, tracker)?;
        self.partition_addresses(proposed, tracker)
    }

    fn proposed_addresses(
        &self,
        message: &OutgoingMessage,
        thread: &Thread,
        local: &LocalAccount,
        tracker: &DeliveryTracker,
    ) -> Result<BTreeSet<Address>, SendError> {
        if matches!(message.kind, MessageKind::Sync) {
            return Ok(BTreeSet::from([local.address()]));
        }

        let sending: BTreeSet<Address> = tracker.sending().into_iter().collect();
        let mut proposed: BTreeSet<Address> = match thread {
            Thread::Contact { contact, .. } => {
                if self.services.recipients.is_blocked(contact)? {
                    info!(contact = %contact, timestamp = message.timestamp, "refusing 1:1 send to blocked contact");
                    return Err(SendError::BlockedContactRecipient);
                }
                BTreeSet::from([contact.clone()])
            }
            Thread::Group(group) => {
                let mut valid = group.members.clone();
                if message.kind.addresses_invited_members() {
                    valid.extend(group.invited.iter().cloned());
                }
                sending.intersection(&valid).cloned().collect()
            }
            Thread::Broadcast { recipients, .. } => sending
                .into_iter()
                .filter(|address| recipients.contains(address))
                .collect(),
        };

        if !thread.is_contact() {
            let mut blocked = Vec::new();
            for address in &proposed {
                if self.services.recipients.is_blocked(address)? {
                    blocked.push(address.clone());
                }
            }
            for address in blocked {
                debug!(recipient = %address, "excluding blocked recipient");
                proposed.remove(&address);
            }
        }

        if !message.kind.can_send_to_self() && !thread.is_contact() {
            proposed.retain(|address| !local.is_local(address));
        }
        Ok(proposed)
    }

    /// Split addresses into service ids and phone numbers still to look
    /// up. Phone numbers already linked to a service id are re-keyed.
    fn partition_addresses(
        &self,
        addresses: BTreeSet<Address>,
        tracker: &DeliveryTracker,
    ) -> Result<ProposedRecipients, SendError> {
        let mut service_ids = BTreeSet::new();
        let mut phone_numbers = Vec::new();
        for address in addresses {
            match &address {
                Address::Service(service_id) => {
                    service_ids.insert(service_id.clone());
                }
                Address::Phone(phone) => {
                    match self.services.recipients.service_id_for_phone(phone)? {
                        Some(service_id) => {
                            tracker.replace_address(&address, &Address::Service(service_id.clone()))?;
                            service_ids.insert(service_id);
                        }
                        None => phone_numbers.push(phone.clone()),
                    }
                }
            }
        }
        Ok(ProposedRecipients {
            service_ids: service_ids.into_iter().collect(),
            phone_numbers,
        })
    }
}
