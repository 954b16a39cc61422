//! Mock federated side for testing
//!
//! Recording `FederatedClient` and in-memory `MessageStore`.

use super::traits::*;
use super::types::*;
use crate::signal::traits::ServiceId;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedMessage {
    pub room: RoomId,
    pub sender: UserId,
    pub body: String,
    pub timestamp: u64,
}

#[derive(Clone, Default)]
pub struct MockFederatedClient {
    state: Arc<Mutex<FederationState>>,
}

#[derive(Default)]
struct FederationState {
    rooms_created: usize,
    sent: Vec<FederatedMessage>,
    fail_sends: usize,
    send_delay: Option<Duration>,
    create_delay: Option<Duration>,
}

impl MockFederatedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_send(&self) {
        self.state.lock().unwrap().fail_sends += 1;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.state.lock().unwrap().send_delay = Some(delay);
    }

    /// Slow room creation, to widen race windows.
    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = Some(delay);
    }

    pub fn rooms_created(&self) -> usize {
        self.state.lock().unwrap().rooms_created
    }

    pub fn sent(&self) -> Vec<FederatedMessage> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl FederatedClient for MockFederatedClient {
    async fn create_room(&self, key: &ConversationKey, _creator: &ServiceId) -> BridgeResult<RoomId> {
        let delay = self.state.lock().unwrap().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.rooms_created += 1;
        Ok(RoomId(format!("!{}-{}:example.org", key.chat_id, state.rooms_created)))
    }

    async fn ghost_for(&self, sender: &ServiceId) -> BridgeResult<UserId> {
        Ok(UserId(format!("@signal_{}:example.org", sender)))
    }

    async fn send_message(
        &self,
        room: &RoomId,
        as_user: &UserId,
        body: &str,
        timestamp: u64,
    ) -> BridgeResult<EventId> {
        let delay = self.state.lock().unwrap().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(BridgeError::Federation("send rejected".to_string()));
        }
        state.sent.push(FederatedMessage {
            room: room.clone(),
            sender: as_user.clone(),
            body: body.to_string(),
            timestamp,
        });
        Ok(EventId(format!("$event{}", state.sent.len())))
    }
}

#[derive(Clone, Default)]
pub struct MemoryMessageStore {
    records: Arc<Mutex<Vec<DeliveryRecord>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeliveryRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert_delivery(&self, record: DeliveryRecord) -> BridgeResult<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}
