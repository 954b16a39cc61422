//! Bridge data model
//!
//! Identifiers on the federated side, the messages carried on a portal's
//! two queues, and what a portal reports back.

use crate::signal::store::DeviceCredential;
use crate::signal::traits::{GroupId, ServiceId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies one portal: the chat on the encrypted network plus the local
/// account that sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    /// Peer service id (direct chat) or hex group id
    pub chat_id: String,
    /// Local account ACI
    pub receiver: String,
}

impl ConversationKey {
    pub fn new(chat_id: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            receiver: receiver.into(),
        }
    }

    pub fn direct(peer: &ServiceId, receiver: &ServiceId) -> Self {
        Self::new(peer.0.clone(), receiver.0.clone())
    }

    pub fn group(group: &GroupId, receiver: &ServiceId) -> Self {
        Self::new(group.to_string(), receiver.0.clone())
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat_id, self.receiver)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Federated room
    RoomId
);
string_id!(
    /// Federated event; doubles as the local message id of a delivery
    EventId
);
string_id!(
    /// Federated user (real or ghost)
    UserId
);

/// Bridge permission levels, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Block = 0,
    Relay = 5,
    User = 10,
    Admin = 100,
}

/// A federated user asking the bridge to send.
#[derive(Debug, Clone)]
pub struct LocalUser {
    pub user_id: UserId,
    pub permission: PermissionLevel,
    /// Linked device, if the user has logged in
    pub device: Option<Arc<DeviceCredential>>,
}

/// Message arriving from the encrypted network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Local account that received it
    pub account: ServiceId,
    pub sender: ServiceId,
    pub body: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundKind {
    Text(String),
    Reaction { relates_to: EventId, key: String },
    Redaction { redacts: EventId },
    Other(String),
}

impl OutboundKind {
    pub fn name(&self) -> &str {
        match self {
            OutboundKind::Text(_) => "message",
            OutboundKind::Reaction { .. } => "reaction",
            OutboundKind::Redaction { .. } => "redaction",
            OutboundKind::Other(kind) => kind,
        }
    }
}

/// Event originating on the federated network.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub event_id: EventId,
    pub room: RoomId,
    pub sender: LocalUser,
    pub kind: OutboundKind,
    /// Origin server timestamp, ms since the epoch
    pub origin_ts: u64,
    /// Scheduled sends get ten times the handling budget
    pub scheduled: bool,
}

/// One row per successfully routed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub event_id: EventId,
    pub room: RoomId,
    pub key: ConversationKey,
    pub sender: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Group send that reached some but not all members
    PartiallyDelivered { sent: usize, total: usize },
    Failed(String),
    /// Handling budget ran out before or during delivery
    TimedOut,
    Rejected(String),
    Skipped(String),
}

impl DeliveryOutcome {
    /// Whether the message counts as delivered (and gets a record).
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            DeliveryOutcome::Delivered | DeliveryOutcome::PartiallyDelivered { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub event_id: EventId,
    pub outcome: DeliveryOutcome,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
