//! Federated-network collaborators
//!
//! Room management and message storage live outside the bridge core; the
//! routing actors only see these traits.

use super::types::{ConversationKey, DeliveryRecord, EventId, RoomId, UserId};
use crate::signal::traits::{ServiceId, SignalError};
use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Federation error: {0}")]
    Federation(String),

    #[error("Message store error: {0}")]
    Store(String),

    #[error("No portal for room {0}")]
    UnknownRoom(RoomId),

    #[error("Portal {0} is shut down")]
    PortalClosed(ConversationKey),

    #[error(transparent)]
    Signal(#[from] SignalError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// The federated chat network, as the bridge uses it.
#[async_trait]
pub trait FederatedClient: Send + Sync {
    /// Create the room backing `key`. Called at most once per portal.
    async fn create_room(&self, key: &ConversationKey, creator: &ServiceId) -> BridgeResult<RoomId>;

    /// Ghost user that speaks for `sender` in federated rooms.
    async fn ghost_for(&self, sender: &ServiceId) -> BridgeResult<UserId>;

    async fn send_message(
        &self,
        room: &RoomId,
        as_user: &UserId,
        body: &str,
        timestamp: u64,
    ) -> BridgeResult<EventId>;
}

/// Delivery record persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_delivery(&self, record: DeliveryRecord) -> BridgeResult<()>;
}
