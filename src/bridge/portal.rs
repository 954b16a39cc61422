//! Conversation Routing Actor
//!
//! One portal per `ConversationKey`. Inbound (encrypted network) and
//! outbound (federated network) messages arrive on two bounded queues and
//! are handled strictly one at a time by a single task.
//!
//! Lifetime: a portal runs until shutdown. With an `idle_timeout` it also
//! exits after that long without traffic; the registry respawns it on the
//! next message. On shutdown anything still queued is discarded and
//! counted. On idle exit queued messages are still handled.

use super::traits::*;
use super::types::*;
use crate::signal::traits::{GroupId, ServiceId, SignalSender};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Multiplier for the handling budget of scheduled messages.
pub const SCHEDULED_TIMEOUT_FACTOR: u32 = 10;

/// Remaining budget below which a delay warning is logged.
const DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalConfig {
    /// Capacity of each input queue
    pub buffer: usize,

    /// Age after which handling is reported as taking long, and past
    /// which a message that has not started is dropped
    pub error_after: Option<Duration>,

    /// Hard bound on handling one outbound message
    pub deadline: Option<Duration>,

    /// Exit after this long without traffic
    pub idle_timeout: Option<Duration>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            buffer: 128,
            error_after: Some(Duration::from_secs(30)),
            deadline: Some(Duration::from_secs(120)),
            idle_timeout: None,
        }
    }
}

impl PortalConfig {
    fn budgets(&self, scheduled: bool) -> (Option<Duration>, Option<Duration>) {
        if scheduled {
            (
                self.error_after.map(|d| d * SCHEDULED_TIMEOUT_FACTOR),
                self.deadline.map(|d| d * SCHEDULED_TIMEOUT_FACTOR),
            )
        } else {
            (self.error_after, self.deadline)
        }
    }
}

/// Room ↔ conversation mapping shared by all portals.
#[derive(Clone, Default)]
pub struct RoomIndex {
    inner: Arc<RwLock<RoomMaps>>,
}

#[derive(Default)]
struct RoomMaps {
    by_room: HashMap<RoomId, ConversationKey>,
    by_key: HashMap<ConversationKey, RoomId>,
}

impl RoomIndex {
    pub async fn insert(&self, room: RoomId, key: ConversationKey) {
        let mut maps = self.inner.write().await;
        maps.by_key.insert(key.clone(), room.clone());
        maps.by_room.insert(room, key);
    }

    pub async fn key_for(&self, room: &RoomId) -> Option<ConversationKey> {
        self.inner.read().await.by_room.get(room).cloned()
    }

    pub async fn room_for(&self, key: &ConversationKey) -> Option<RoomId> {
        self.inner.read().await.by_key.get(key).cloned()
    }
}

/// Everything a portal needs from the outside world.
#[derive(Clone)]
pub struct PortalContext {
    pub federation: Arc<dyn FederatedClient>,
    pub signal: Arc<dyn SignalSender>,
    pub store: Arc<dyn MessageStore>,
    pub rooms: RoomIndex,
    pub reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
}

/// Producer side of one portal.
#[derive(Clone)]
pub struct PortalHandle {
    key: ConversationKey,
    inbound: mpsc::Sender<InboundMessage>,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl PortalHandle {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Waits for queue capacity. Fails once the portal has exited.
    pub async fn enqueue_inbound(&self, message: InboundMessage) -> Result<(), InboundMessage> {
        self.inbound.send(message).await.map_err(|e| e.0)
    }

    pub async fn enqueue_outbound(&self, message: OutboundMessage) -> Result<(), OutboundMessage> {
        self.outbound.send(message).await.map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed() || self.outbound.is_closed()
    }
}

pub struct Portal {
    key: ConversationKey,
    config: PortalConfig,
    ctx: PortalContext,
    room: Mutex<Option<RoomId>>,
}

impl Portal {
    /// Start the actor task. `room` seeds an already known room.
    pub fn spawn(
        key: ConversationKey,
        config: PortalConfig,
        ctx: PortalContext,
        room: Option<RoomId>,
        shutdown: watch::Receiver<bool>,
    ) -> (PortalHandle, JoinHandle<()>) {
        let buffer = config.buffer.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);

        let portal = Portal {
            key: key.clone(),
            config,
            ctx,
            room: Mutex::new(room),
        };
        let task = tokio::spawn(portal.run(inbound_rx, outbound_rx, shutdown));

        (
            PortalHandle {
                key,
                inbound: inbound_tx,
                outbound: outbound_tx,
            },
            task,
        )
    }

    async fn run(
        self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut outbound: mpsc::Receiver<OutboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(chat_id = %self.key.chat_id, receiver = %self.key.receiver, "Portal started");
        let idle_timeout = self.config.idle_timeout;

        let discard = loop {
            if *shutdown.borrow() {
                break true;
            }
            let idle = async {
                match idle_timeout {
                    Some(d) => sleep(d).await,
                    None => std::future::pending().await,
                }
            };

            // Shutdown first, then inbound before outbound when both are ready.
            tokio::select! {
                biased;
                _ = shutdown.changed() => break true,
                Some(message) = inbound.recv() => self.handle_inbound(message).await,
                Some(message) = outbound.recv() => self.handle_outbound(message).await,
                _ = idle => {
                    info!(chat_id = %self.key.chat_id, "Portal idle, exiting");
                    break false;
                }
                else => break false,
            }
        };

        inbound.close();
        outbound.close();

        if discard {
            let mut discarded = 0usize;
            while inbound.try_recv().is_ok() {
                discarded += 1;
            }
            while outbound.try_recv().is_ok() {
                discarded += 1;
            }
            if discarded > 0 {
                warn!(
                    chat_id = %self.key.chat_id,
                    receiver = %self.key.receiver,
                    "Discarded {} queued messages at shutdown",
                    discarded
                );
            }
        } else {
            // Accepted before the queues closed; still ours to handle.
            while let Ok(message) = inbound.try_recv() {
                self.handle_inbound(message).await;
            }
            while let Ok(message) = outbound.try_recv() {
                self.handle_outbound(message).await;
            }
        }
        debug!(chat_id = %self.key.chat_id, receiver = %self.key.receiver, "Portal stopped");
    }

    /// Room for this portal, created on first use. The lock is held across
    /// creation so concurrent callers see exactly one room.
    async fn ensure_room(&self, creator: &ServiceId) -> BridgeResult<RoomId> {
        let mut room = self.room.lock().await;
        if let Some(existing) = room.as_ref() {
            return Ok(existing.clone());
        }

        debug!(chat_id = %self.key.chat_id, "Creating room from incoming message");
        let created = self.ctx.federation.create_room(&self.key, creator).await?;
        self.ctx.rooms.insert(created.clone(), self.key.clone()).await;
        info!(chat_id = %self.key.chat_id, room = %created, "Created room");
        *room = Some(created.clone());
        Ok(created)
    }

    async fn remember_room(&self, room: &RoomId) {
        let mut current = self.room.lock().await;
        if current.is_none() {
            *current = Some(room.clone());
        }
    }

    async fn handle_inbound(&self, message: InboundMessage) {
        if let Err(e) = self.relay_inbound(&message).await {
            // At-most-once: the encrypted network redelivers if it wants to.
            error!(
                chat_id = %self.key.chat_id,
                sender = %message.sender,
                "Dropping inbound message: {}",
                e
            );
        }
    }

    async fn relay_inbound(&self, message: &InboundMessage) -> BridgeResult<()> {
        let room = self.ensure_room(&message.sender).await?;
        let ghost = self.ctx.federation.ghost_for(&message.sender).await?;
        let event_id = self
            .ctx
            .federation
            .send_message(&room, &ghost, &message.body, message.timestamp)
            .await?;

        debug!(chat_id = %self.key.chat_id, event_id = %event_id, "Relayed inbound message");
        self.ctx
            .store
            .insert_delivery(DeliveryRecord {
                event_id,
                room,
                key: self.key.clone(),
                sender: message.sender.0.clone(),
                timestamp: message.timestamp,
            })
            .await
    }

    async fn handle_outbound(&self, message: OutboundMessage) {
        let outcome = self.deliver_outbound(&message).await;

        match &outcome {
            DeliveryOutcome::Delivered => {
                debug!(event_id = %message.event_id, chat_id = %self.key.chat_id, "Delivered")
            }
            DeliveryOutcome::PartiallyDelivered { sent, total } => warn!(
                event_id = %message.event_id,
                chat_id = %self.key.chat_id,
                "Only sent to {} of {} group members",
                sent,
                total
            ),
            DeliveryOutcome::Skipped(reason) | DeliveryOutcome::Rejected(reason) => {
                info!(event_id = %message.event_id, "Not sending: {}", reason)
            }
            DeliveryOutcome::Failed(reason) => error!(
                event_id = %message.event_id,
                chat_id = %self.key.chat_id,
                "Send failed: {}",
                reason
            ),
            DeliveryOutcome::TimedOut => error!(
                event_id = %message.event_id,
                chat_id = %self.key.chat_id,
                "Message handling timed out"
            ),
        }

        if let Some(reports) = &self.ctx.reports {
            let _ = reports.send(DeliveryReport {
                event_id: message.event_id.clone(),
                outcome,
            });
        }
    }

    async fn deliver_outbound(&self, message: &OutboundMessage) -> DeliveryOutcome {
        if message.sender.permission < PermissionLevel::User {
            return DeliveryOutcome::Rejected(format!(
                "{} lacks permission to send",
                message.sender.user_id
            ));
        }
        let body = match &message.kind {
            OutboundKind::Text(body) => body,
            other => {
                warn!(event_type = %other.name(), "Unhandled federated event type");
                return DeliveryOutcome::Skipped(format!("unsupported {}", other.name()));
            }
        };
        let Some(device) = message.sender.device.clone() else {
            return DeliveryOutcome::Failed(format!("{} is not logged in", message.sender.user_id));
        };
        self.remember_room(&message.room).await;

        let (error_after, deadline) = self.config.budgets(message.scheduled);
        let age = Duration::from_millis(now_millis().saturating_sub(message.origin_ts));
        debug!(event_id = %message.event_id, "Handling outbound message (age {:?})", age);

        if deadline.is_some_and(|d| age >= d) {
            return DeliveryOutcome::TimedOut;
        }
        let mut slow_timer = None;
        if let Some(error_after) = error_after {
            let Some(remaining) = error_after.checked_sub(age) else {
                return DeliveryOutcome::TimedOut;
            };
            if remaining < DELAY_WARNING_THRESHOLD {
                warn!(
                    event_id = %message.event_id,
                    "Message was delayed before reaching the bridge, only {:?} (of {:?}) left",
                    remaining,
                    error_after
                );
            }
            let event_id = message.event_id.clone();
            slow_timer = Some(tokio::spawn(async move {
                sleep(remaining).await;
                warn!(event_id = %event_id, "Message handling is taking long");
            }));
        }

        let timestamp = now_millis();
        let send = self.send(&device, body, timestamp);
        let outcome = match deadline {
            Some(d) => timeout(d.saturating_sub(age), send)
                .await
                .unwrap_or(DeliveryOutcome::TimedOut),
            None => send.await,
        };
        if let Some(timer) = slow_timer {
            timer.abort();
        }

        if outcome.is_delivered() {
            let record = DeliveryRecord {
                event_id: message.event_id.clone(),
                room: message.room.clone(),
                key: self.key.clone(),
                sender: device.account.aci.clone(),
                timestamp,
            };
            if let Err(e) = self.ctx.store.insert_delivery(record).await {
                error!(event_id = %message.event_id, "Failed to record delivery: {}", e);
            }
        }
        outcome
    }

    /// Direct chats are keyed by a UUID; anything else is a group.
    async fn send(
        &self,
        device: &crate::signal::store::DeviceCredential,
        body: &str,
        timestamp: u64,
    ) -> DeliveryOutcome {
        let chat_id = &self.key.chat_id;

        if uuid::Uuid::parse_str(chat_id).is_ok() {
            return match self
                .ctx
                .signal
                .send_message(device, &ServiceId(chat_id.clone()), body, timestamp)
                .await
            {
                Ok(_) => DeliveryOutcome::Delivered,
                Err(e) => DeliveryOutcome::Failed(e.to_string()),
            };
        }

        let Some(group) = GroupId::parse(chat_id) else {
            return DeliveryOutcome::Failed(format!("unroutable chat id {}", chat_id));
        };
        match self
            .ctx
            .signal
            .send_group_message(device, &group, body, timestamp)
            .await
        {
            Ok(result) => {
                let sent = result.successfully_sent_to.len();
                let total = sent + result.failed_to_send_to.len();
                if sent == 0 {
                    DeliveryOutcome::Failed(format!(
                        "failed to send to any of {} group members",
                        total
                    ))
                } else if sent < total {
                    DeliveryOutcome::PartiallyDelivered { sent, total }
                } else {
                    DeliveryOutcome::Delivered
                }
            }
            Err(e) => DeliveryOutcome::Failed(e.to_string()),
        }
    }
}
