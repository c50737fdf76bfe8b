use std::collections::BTreeSet;

use crate::ids::{Address, ThreadId};
use crate::message::MessageKind;

/// A conversation a message can be sent to.
#[derive(Debug, Clone)]
pub enum Thread {
    /// One-to-one conversation. A contact equal to the local account is the
    /// note-to-self thread.
    Contact { id: ThreadId, contact: Address },
    Group(GroupThread),
    /// Fixed recipient list (distribution lists, story audiences).
    Broadcast { id: ThreadId, recipients: Vec<Address> },
}

#[derive(Debug, Clone)]
pub struct GroupThread {
    pub id: ThreadId,
    /// Group identifier carried inside sealed envelopes.
    pub group_id: Vec<u8>,
    pub members: BTreeSet<Address>,
    /// Invited members who have not joined yet.
    pub invited: BTreeSet<Address>,
    pub uses_sender_key: bool,
    pub announcement_only: bool,
    pub local_is_admin: bool,
}

impl Thread {
    pub fn id(&self) -> &ThreadId {
        match self {
            Self::Contact { id, .. } | Self::Broadcast { id, .. } => id,
            Self::Group(group) => &group.id,
        }
    }

    pub fn is_contact(&self) -> bool {
        matches!(self, Self::Contact { .. })
    }

    pub fn uses_sender_key(&self) -> bool {
        match self {
            Self::Group(group) => group.uses_sender_key,
            Self::Contact { .. } | Self::Broadcast { .. } => false,
        }
    }

    pub fn group_id(&self) -> Option<&[u8]> {
        match self {
            Self::Group(group) => Some(&group.group_id),
            Self::Contact { .. } | Self::Broadcast { .. } => None,
        }
    }

    /// Announcement-only groups accept chat messages from admins only.
    pub fn can_send(&self, kind: MessageKind) -> bool {
        match self {
            Self::Group(group) if group.announcement_only && !group.local_is_admin => {
                !kind.is_user_visible() || matches!(kind, MessageKind::GroupUpdate)
            }
            _ => true,
        }
    }

    /// Current members this thread delivers to (full members only for groups).
    pub fn participants(&self) -> Vec<Address> {
        match self {
            Self::Contact { contact, .. } => vec![contact.clone()],
            Self::Group(group) => group.members.iter().cloned().collect(),
            Self::Broadcast { recipients, .. } => recipients.clone(),
        }
    }

    pub fn contains(&self, address: &Address) -> bool {
        match self {
            Self::Contact { contact, .. } => contact == address,
            Self::Group(group) => group.members.contains(address),
            Self::Broadcast { recipients, .. } => recipients.contains(address),
        }
    }
}
