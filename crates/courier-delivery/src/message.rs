use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{Address, ThreadId};

/// How per-device payloads are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionStyle {
    /// Session ratchet encryption.
    Whisper,
    /// Unencrypted content envelope (decryption-error resend requests only).
    Plaintext,
}

/// What an outgoing message is. Every policy decision that depends on the
/// kind of message is an exhaustive match on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Data { is_voice: bool, is_view_once: bool },
    Reaction,
    GroupUpdate,
    Receipt,
    Typing,
    Story,
    /// Copy of our own message for our other devices.
    Sync,
    CallSignal { is_offer: bool },
    /// Asks a sender to resend a message we could not decrypt.
    ResendRequest,
    /// Answer to another device's resend request.
    ResendResponse,
    /// Carries this thread's sender key to one recipient on behalf of the
    /// message with timestamp `on_behalf_of`.
    SenderKeyDistribution {
        on_behalf_of: u64,
        for_online_message: bool,
    },
}

impl MessageKind {
    /// Kinds that are transmitted to our own other devices.
    pub fn can_send_to_self(self) -> bool {
        match self {
            Self::Sync | Self::CallSignal { .. } | Self::ResendRequest | Self::ResendResponse => {
                true
            }
            Self::Data { .. }
            | Self::Reaction
            | Self::GroupUpdate
            | Self::Receipt
            | Self::Typing
            | Self::Story
            | Self::SenderKeyDistribution { .. } => false,
        }
    }

    /// Delivered only to devices that are online right now.
    pub fn is_online_only(self) -> bool {
        matches!(self, Self::Typing)
    }

    /// Never worth establishing a new session for.
    pub fn is_transient(self) -> bool {
        match self {
            Self::Typing => true,
            Self::SenderKeyDistribution {
                for_online_message, ..
            } => for_online_message,
            _ => false,
        }
    }

    pub fn encryption_style(self) -> EncryptionStyle {
        match self {
            Self::ResendRequest => EncryptionStyle::Plaintext,
            _ => EncryptionStyle::Whisper,
        }
    }

    /// Whether the plaintext is kept so it can be resent on request.
    pub fn records_payload(self) -> bool {
        match self {
            Self::Data { .. }
            | Self::Reaction
            | Self::GroupUpdate
            | Self::Receipt
            | Self::Sync
            | Self::CallSignal { .. } => true,
            Self::Typing
            | Self::Story
            | Self::ResendRequest
            | Self::ResendResponse
            | Self::SenderKeyDistribution { .. } => false,
        }
    }

    /// Group updates also go to invited (pending) members.
    pub fn addresses_invited_members(self) -> bool {
        matches!(self, Self::GroupUpdate)
    }

    /// Shown in the conversation, so its delivery state is persisted.
    pub fn is_user_visible(self) -> bool {
        match self {
            Self::Data { .. } | Self::Reaction | Self::GroupUpdate | Self::Story => true,
            Self::Receipt
            | Self::Typing
            | Self::Sync
            | Self::CallSignal { .. }
            | Self::ResendRequest
            | Self::ResendResponse
            | Self::SenderKeyDistribution { .. } => false,
        }
    }

    /// Sending this expresses intent to resume a hidden conversation.
    pub fn unhides_recipient(self) -> bool {
        match self {
            Self::Data { .. } | Self::Reaction => true,
            Self::CallSignal { is_offer } => is_offer,
            _ => false,
        }
    }

    pub fn allows_sender_key(self) -> bool {
        match self {
            Self::Data { .. }
            | Self::Reaction
            | Self::GroupUpdate
            | Self::Receipt
            | Self::Typing
            | Self::Story => true,
            Self::Sync
            | Self::CallSignal { .. }
            | Self::ResendRequest
            | Self::ResendResponse
            | Self::SenderKeyDistribution { .. } => false,
        }
    }

    pub fn allows_sealed_sender(self) -> bool {
        !matches!(self, Self::ResendRequest | Self::Sync)
    }

    /// Our other devices learn about this message from a sync transcript.
    pub fn needs_sync_transcript(self) -> bool {
        matches!(
            self,
            Self::Data { .. } | Self::Reaction | Self::GroupUpdate | Self::Story
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Data { .. } => "data",
            Self::Reaction => "reaction",
            Self::GroupUpdate => "group-update",
            Self::Receipt => "receipt",
            Self::Typing => "typing",
            Self::Story => "story",
            Self::Sync => "sync",
            Self::CallSignal { .. } => "call",
            Self::ResendRequest => "resend-request",
            Self::ResendResponse => "resend-response",
            Self::SenderKeyDistribution { .. } => "sender-key-distribution",
        }
    }
}

/// Delivery state of one recipient of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientState {
    Pending,
    Sending,
    Sent { sealed_sender: bool },
    Skipped,
    Failed { error: String },
}

impl RecipientState {
    /// Still owed a delivery attempt.
    pub fn is_unsent(&self) -> bool {
        matches!(self, Self::Pending | Self::Sending | Self::Failed { .. })
    }
}

/// A composed message waiting to be delivered.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Correlates the message across devices, receipts, and resend requests.
    pub timestamp: u64,
    pub thread_id: ThreadId,
    pub kind: MessageKind,
    /// Serialized content to encrypt.
    pub content: Bytes,
    /// Attachment ids that must be uploaded before sending.
    pub attachments: Vec<String>,
    pub should_be_saved: bool,
    pub is_urgent: bool,
    pub recipient_states: BTreeMap<Address, RecipientState>,
}

impl OutgoingMessage {
    pub fn new(
        timestamp: u64,
        thread_id: ThreadId,
        kind: MessageKind,
        content: impl Into<Bytes>,
    ) -> Self {
        Self {
            timestamp,
            thread_id,
            kind,
            content: content.into(),
            attachments: Vec::new(),
            should_be_saved: kind.is_user_visible(),
            is_urgent: !matches!(kind, MessageKind::Typing | MessageKind::Receipt),
            recipient_states: BTreeMap::new(),
        }
    }

    /// Address the message to `recipients`, each starting out pending.
    pub fn with_recipients(mut self, recipients: impl IntoIterator<Item = Address>) -> Self {
        self.recipient_states
            .extend(recipients.into_iter().map(|a| (a, RecipientState::Pending)));
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn is_story(&self) -> bool {
        matches!(self.kind, MessageKind::Story)
    }

    pub fn is_online(&self) -> bool {
        self.kind.is_online_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_control_kinds_target_self() {
        assert!(MessageKind::Sync.can_send_to_self());
        assert!(MessageKind::CallSignal { is_offer: false }.can_send_to_self());
        assert!(MessageKind::ResendRequest.can_send_to_self());
        assert!(!MessageKind::Data {
            is_voice: false,
            is_view_once: false
        }
        .can_send_to_self());
    }

    #[test]
    fn resend_requests_are_plaintext_and_never_sealed() {
        assert_eq!(
            MessageKind::ResendRequest.encryption_style(),
            EncryptionStyle::Plaintext
        );
        assert!(!MessageKind::ResendRequest.allows_sealed_sender());
        assert!(!MessageKind::ResendRequest.records_payload());
    }

    #[test]
    fn online_distribution_is_transient() {
        let online = MessageKind::SenderKeyDistribution {
            on_behalf_of: 1,
            for_online_message: true,
        };
        let offline = MessageKind::SenderKeyDistribution {
            on_behalf_of: 1,
            for_online_message: false,
        };
        assert!(online.is_transient());
        assert!(!offline.is_transient());
        assert!(MessageKind::Typing.is_transient());
    }

    #[test]
    fn only_offers_unhide_among_calls() {
        assert!(MessageKind::CallSignal { is_offer: true }.unhides_recipient());
        assert!(!MessageKind::CallSignal { is_offer: false }.unhides_recipient());
        assert!(MessageKind::Reaction.unhides_recipient());
        assert!(!MessageKind::Receipt.unhides_recipient());
    }

    #[test]
    fn new_message_defaults_follow_kind() {
        let typing = OutgoingMessage::new(1, ThreadId::new("t"), MessageKind::Typing, "x");
        assert!(!typing.should_be_saved);
        assert!(!typing.is_urgent);
        assert!(typing.is_online());

        let data = OutgoingMessage::new(
            1,
            ThreadId::new("t"),
            MessageKind::Data {
                is_voice: false,
                is_view_once: false,
            },
            "x",
        )
        .with_recipients([Address::service("a")]);
        assert!(data.should_be_saved);
        assert_eq!(
            data.recipient_states.get(&Address::service("a")),
            Some(&RecipientState::Pending)
        );
    }
}
