//! Portal registry
//!
//! Maps each `ConversationKey` to its portal, spawning portals lazily on
//! first traffic. One lock guards lookup and insert. A portal that has
//! exited (idle timeout) is replaced on the next message for its key.

use super::portal::{Portal, PortalConfig, PortalContext, PortalHandle, RoomIndex};
use super::traits::*;
use super::types::*;
use crate::signal::receiver::{EnvelopeHandler, ReceivedMessage};
use crate::signal::traits::{SignalError, SignalResult, SignalSender};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct PortalEntry {
    handle: PortalHandle,
    task: JoinHandle<()>,
}

pub struct PortalRegistry {
    config: PortalConfig,
    ctx: PortalContext,
    portals: Mutex<HashMap<ConversationKey, PortalEntry>>,
    shutdown: watch::Sender<bool>,
}

impl PortalRegistry {
    pub fn new(
        config: PortalConfig,
        federation: Arc<dyn FederatedClient>,
        signal: Arc<dyn SignalSender>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            ctx: PortalContext {
                federation,
                signal,
                store,
                rooms: RoomIndex::default(),
                reports: None,
            },
            portals: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Send a `DeliveryReport` for every outbound message to `reports`.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<DeliveryReport>) -> Self {
        self.ctx.reports = Some(reports);
        self
    }

    pub fn rooms(&self) -> &RoomIndex {
        &self.ctx.rooms
    }

    /// Record a room that already exists for `key`.
    pub async fn register_room(&self, room: RoomId, key: ConversationKey) {
        self.ctx.rooms.insert(room, key).await;
    }

    /// Live portal for `key`, spawned if absent or exited.
    pub async fn portal(&self, key: &ConversationKey) -> BridgeResult<PortalHandle> {
        if *self.shutdown.borrow() {
            return Err(BridgeError::PortalClosed(key.clone()));
        }

        let mut portals = self.portals.lock().await;
        if let Some(entry) = portals.get(key) {
            if !entry.handle.is_closed() {
                return Ok(entry.handle.clone());
            }
            debug!(chat_id = %key.chat_id, receiver = %key.receiver, "Respawning exited portal");
        }

        let room = self.ctx.rooms.room_for(key).await;
        let (handle, task) = Portal::spawn(
            key.clone(),
            self.config.clone(),
            self.ctx.clone(),
            room,
            self.shutdown.subscribe(),
        );
        portals.insert(
            key.clone(),
            PortalEntry {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    /// Queue a message from the encrypted network. Blocks while the
    /// portal's queue is full.
    pub async fn enqueue_inbound(
        &self,
        key: &ConversationKey,
        message: InboundMessage,
    ) -> BridgeResult<()> {
        let handle = self.portal(key).await?;
        match handle.enqueue_inbound(message).await {
            Ok(()) => Ok(()),
            // Exited between lookup and send; one fresh portal gets it.
            Err(message) => self
                .portal(key)
                .await?
                .enqueue_inbound(message)
                .await
                .map_err(|_| BridgeError::PortalClosed(key.clone())),
        }
    }

    /// Queue a federated event for the portal that owns its room.
    pub async fn enqueue_outbound(&self, message: OutboundMessage) -> BridgeResult<()> {
        let key = self
            .ctx
            .rooms
            .key_for(&message.room)
            .await
            .ok_or_else(|| BridgeError::UnknownRoom(message.room.clone()))?;

        let handle = self.portal(&key).await?;
        match handle.enqueue_outbound(message).await {
            Ok(()) => Ok(()),
            Err(message) => self
                .portal(&key)
                .await?
                .enqueue_outbound(message)
                .await
                .map_err(|_| BridgeError::PortalClosed(key.clone())),
        }
    }

    /// Number of portals currently running.
    pub async fn active_portals(&self) -> usize {
        self.portals
            .lock()
            .await
            .values()
            .filter(|entry| !entry.handle.is_closed())
            .count()
    }

    /// Stop every portal and wait for them. Queued messages are discarded.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let entries: Vec<PortalEntry> = self.portals.lock().await.drain().map(|(_, e)| e).collect();
        info!("Shutting down {} portals", entries.len());

        for entry in entries {
            if let Err(e) = entry.task.await {
                warn!(chat_id = %entry.handle.key().chat_id, "Portal task failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl EnvelopeHandler for PortalRegistry {
    async fn handle_message(&self, message: ReceivedMessage) -> SignalResult<()> {
        let key = match &message.group {
            Some(group) => ConversationKey::group(group, &message.receiver),
            None => ConversationKey::direct(&message.sender, &message.receiver),
        };
        let inbound = InboundMessage {
            account: message.receiver,
            sender: message.sender,
            body: message.body,
            timestamp: message.timestamp,
        };
        self.enqueue_inbound(&key, inbound)
            .await
            .map_err(|e| SignalError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::{MemoryMessageStore, MockFederatedClient};
    use crate::signal::mock::MockSignalSender;
    use crate::signal::store::sample_device;
    use crate::signal::traits::{GroupId, ServiceId};
    use std::time::Duration;

    fn registry(config: PortalConfig) -> (PortalRegistry, MockFederatedClient, MemoryMessageStore) {
        let federation = MockFederatedClient::new();
        let store = MemoryMessageStore::new();
        let registry = PortalRegistry::new(
            config,
            Arc::new(federation.clone()),
            Arc::new(MockSignalSender::new()),
            Arc::new(store.clone()),
        );
        (registry, federation, store)
    }

    fn received(sender: &str, group: Option<GroupId>, body: &str) -> ReceivedMessage {
        ReceivedMessage {
            sender: ServiceId::from(sender),
            source_device: 1,
            receiver: ServiceId::from("me"),
            group,
            body: body.to_string(),
            timestamp: 10,
        }
    }

    #[tokio::test]
    async fn test_one_portal_per_key() {
        let (registry, _, _) = registry(PortalConfig::default());
        let key = ConversationKey::new("a", "me");

        let first = registry.portal(&key).await.unwrap();
        let second = registry.portal(&key).await.unwrap();
        assert_eq!(first.key(), second.key());
        registry.portal(&ConversationKey::new("b", "me")).await.unwrap();

        assert_eq!(registry.active_portals().await, 2);
        registry.shutdown().await;
        assert_eq!(registry.active_portals().await, 0);
    }

    #[tokio::test]
    async fn test_envelope_handler_routes_by_group_or_sender() {
        let (registry, federation, store) = registry(PortalConfig::default());
        let group = GroupId(vec![1, 2, 3]);

        registry
            .handle_message(received("alice", None, "direct"))
            .await
            .unwrap();
        registry
            .handle_message(received("alice", Some(group.clone()), "in group"))
            .await
            .unwrap();
        registry
            .handle_message(received("bob", Some(group.clone()), "also in group"))
            .await
            .unwrap();

        // Wait for the portals to work through their queues.
        for _ in 0..100 {
            if store.records().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(registry.active_portals().await, 2);
        assert_eq!(federation.rooms_created(), 2);
        let group_key = ConversationKey::group(&group, &ServiceId::from("me"));
        assert!(registry.rooms().room_for(&group_key).await.is_some());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_outbound_for_unknown_room_is_rejected() {
        let (registry, _, _) = registry(PortalConfig::default());
        let message = OutboundMessage {
            event_id: EventId::from("$1"),
            room: RoomId::from("!nowhere:example.org"),
            sender: LocalUser {
                user_id: UserId::from("@a:example.org"),
                permission: PermissionLevel::User,
                device: Some(Arc::new(sample_device())),
            },
            kind: OutboundKind::Text("hi".to_string()),
            origin_ts: now_millis(),
            scheduled: false,
        };

        assert!(matches!(
            registry.enqueue_outbound(message).await,
            Err(BridgeError::UnknownRoom(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_portal_is_respawned() {
        let (registry, _, store) = registry(PortalConfig {
            idle_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let key = ConversationKey::new("alice", "me");

        registry
            .enqueue_inbound(&key, InboundMessage {
                account: ServiceId::from("me"),
                sender: ServiceId::from("alice"),
                body: "first".to_string(),
                timestamp: 1,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.active_portals().await, 0);

        registry
            .enqueue_inbound(&key, InboundMessage {
                account: ServiceId::from("me"),
                sender: ServiceId::from("alice"),
                body: "second".to_string(),
                timestamp: 2,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let records = store.records();
        assert_eq!(records.len(), 2);
        // The respawned portal reuses the room from the index.
        assert_eq!(records[0].room, records[1].room);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_portals_after_shutdown() {
        let (registry, _, _) = registry(PortalConfig::default());
        registry.shutdown().await;
        assert!(matches!(
            registry.portal(&ConversationKey::new("a", "me")).await,
            Err(BridgeError::PortalClosed(_))
        ));
    }
}
