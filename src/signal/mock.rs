//! Mock collaborators for testing
//!
//! In-process stand-ins for the chat service: a channel-backed transport
//! pair, a connector that hands those out, and recording implementations
//! of the key registrar, sender and message sink.

use super::prekeys::{PreKeyBatch, PreKeyUpload};
use super::store::{Credentials, DeviceCredential};
use super::traits::*;
use super::transport::{decode_frame, encode_frame, Connector, Frame, FrameTransport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One end of an in-memory duplex connection. Frames cross as encoded
/// bytes, so the codec is exercised too.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Create a connected pair `(client, server)`.
pub fn channel_transport() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport { tx: a_tx, rx: b_rx },
        ChannelTransport { tx: b_tx, rx: a_rx },
    )
}

#[async_trait]
impl FrameTransport for ChannelTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(encode_frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<Frame, TransportError> {
        let bytes = self.rx.recv().await.ok_or(TransportError::Closed)?;
        decode_frame(&bytes)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.rx.close();
        Ok(())
    }
}

/// Hands out pre-built client ends in order and records requested paths.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

#[derive(Default)]
struct ConnectorState {
    pending: VecDeque<ChannelTransport>,
    paths: Vec<String>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connection; returns the server end.
    pub fn push_connection(&self) -> ChannelTransport {
        let (client, server) = channel_transport();
        self.state.lock().unwrap().pending.push_back(client);
        server
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.lock().unwrap().paths.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, path: &str) -> Result<Box<dyn FrameTransport>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.paths.push(path.to_string());
        match state.pending.pop_front() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(TransportError::Connect {
                url: path.to_string(),
                reason: "no mock connection queued".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub username: String,
    pub kind: IdentityKind,
    pub upload: PreKeyUpload,
    pub batch: PreKeyBatch,
}

/// Records key uploads; can be told to fail the next `n` calls.
#[derive(Clone, Default)]
pub struct MockKeyRegistrar {
    state: Arc<Mutex<RegistrarState>>,
}

#[derive(Default)]
struct RegistrarState {
    uploads: Vec<RecordedUpload>,
    failures: VecDeque<SignalError>,
    attempts: u32,
}

impl MockKeyRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: SignalError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().unwrap().attempts
    }
}

#[async_trait]
impl KeyRegistrar for MockKeyRegistrar {
    async fn register_pre_keys(
        &self,
        credentials: &Credentials,
        kind: IdentityKind,
        batch: &PreKeyBatch,
    ) -> SignalResult<()> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state.uploads.push(RecordedUpload {
            username: credentials.username.clone(),
            kind,
            upload: batch.to_upload(),
            batch: batch.clone(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    User(ServiceId),
    Group(GroupId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: Recipient,
    pub content: String,
}

/// Scriptable sender. Recipients marked unreachable fail; group sends fan
/// out over the configured membership.
#[derive(Clone, Default)]
pub struct MockSignalSender {
    state: Arc<Mutex<SenderState>>,
}

#[derive(Default)]
struct SenderState {
    sent: Vec<SentMessage>,
    groups: HashMap<GroupId, Vec<ServiceId>>,
    unreachable: HashSet<ServiceId>,
    delay: Option<std::time::Duration>,
}

impl MockSignalSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_group(&self, group: GroupId, members: Vec<ServiceId>) {
        self.state.lock().unwrap().groups.insert(group, members);
    }

    pub fn set_unreachable(&self, member: ServiceId) {
        self.state.lock().unwrap().unreachable.insert(member);
    }

    /// Make every send take at least `delay`.
    pub fn set_delay(&self, delay: std::time::Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    fn delay(&self) -> Option<std::time::Duration> {
        self.state.lock().unwrap().delay
    }
}

#[async_trait]
impl SignalSender for MockSignalSender {
    async fn send_message(
        &self,
        _account: &DeviceCredential,
        recipient: &ServiceId,
        text: &str,
        timestamp: u64,
    ) -> SignalResult<u64> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.unreachable.contains(recipient) {
            return Err(SignalError::Network(format!("{} unreachable", recipient)));
        }
        state.sent.push(SentMessage {
            recipient: Recipient::User(recipient.clone()),
            content: text.to_string(),
        });
        Ok(timestamp)
    }

    async fn send_group_message(
        &self,
        _account: &DeviceCredential,
        group: &GroupId,
        text: &str,
        _timestamp: u64,
    ) -> SignalResult<GroupSendResult> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        let members = state
            .groups
            .get(group)
            .cloned()
            .ok_or_else(|| SignalError::GroupNotFound(group.to_string()))?;

        let mut result = GroupSendResult::default();
        for member in members {
            if state.unreachable.contains(&member) {
                let error = SignalError::Network(format!("{} unreachable", member));
                result.failed_to_send_to.push((member, error));
            } else {
                result.successfully_sent_to.push(member);
            }
        }
        if !result.successfully_sent_to.is_empty() {
            state.sent.push(SentMessage {
                recipient: Recipient::Group(group.clone()),
                content: text.to_string(),
            });
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredPayload {
    pub username: String,
    pub destination: ServiceId,
    pub content: Vec<u8>,
    pub timestamp: u64,
}

/// Records encrypted payloads; destinations marked unreachable fail.
#[derive(Clone, Default)]
pub struct MockMessageSink {
    state: Arc<Mutex<SinkState>>,
}

#[derive(Default)]
struct SinkState {
    delivered: Vec<DeliveredPayload>,
    unreachable: HashSet<ServiceId>,
}

impl MockMessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, destination: ServiceId) {
        self.state.lock().unwrap().unreachable.insert(destination);
    }

    pub fn delivered(&self) -> Vec<DeliveredPayload> {
        self.state.lock().unwrap().delivered.clone()
    }
}

#[async_trait]
impl MessageSink for MockMessageSink {
    async fn deliver(
        &self,
        credentials: &Credentials,
        destination: &ServiceId,
        content: &[u8],
        timestamp: u64,
    ) -> SignalResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable.contains(destination) {
            return Err(SignalError::Http {
                status: 404,
                message: "Not Found".to_string(),
            });
        }
        state.delivered.push(DeliveredPayload {
            username: credentials.username.clone(),
            destination: destination.clone(),
            content: content.to_vec(),
            timestamp,
        });
        Ok(())
    }
}

/// Static group membership.
#[derive(Clone, Default)]
pub struct MockGroupDirectory {
    groups: Arc<Mutex<HashMap<GroupId, Vec<ServiceId>>>>,
}

impl MockGroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_group(&self, group: GroupId, members: Vec<ServiceId>) {
        self.groups.lock().unwrap().insert(group, members);
    }
}

#[async_trait]
impl GroupDirectory for MockGroupDirectory {
    async fn members(&self, group: &GroupId) -> SignalResult<Vec<ServiceId>> {
        self.groups
            .lock()
            .unwrap()
            .get(group)
            .cloned()
            .ok_or_else(|| SignalError::GroupNotFound(group.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::store::sample_device;
    use crate::signal::transport::RequestEnvelope;

    #[tokio::test]
    async fn test_channel_transport_is_duplex() {
        let (mut client, mut server) = channel_transport();
        let frame = Frame::Request(RequestEnvelope::new(1, "GET", "/"));

        client.send(frame.clone()).await.unwrap();
        assert_eq!(server.receive().await.unwrap(), frame);

        drop(server);
        assert_eq!(client.receive().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_connector_without_queued_connection_fails() {
        let connector = MockConnector::new();
        assert!(connector.connect("/v1/websocket/").await.is_err());
        assert_eq!(connector.paths(), vec!["/v1/websocket/".to_string()]);
    }

    #[tokio::test]
    async fn test_group_send_partitions_members() {
        let sender = MockSignalSender::new();
        let group = GroupId(vec![1, 2, 3]);
        let (a, b) = (ServiceId::from("a"), ServiceId::from("b"));
        sender.set_group(group.clone(), vec![a.clone(), b.clone()]);
        sender.set_unreachable(b.clone());

        let result = sender
            .send_group_message(&sample_device(), &group, "hi", 1)
            .await
            .unwrap();
        assert_eq!(result.successfully_sent_to, vec![a]);
        assert_eq!(result.failed_to_send_to.len(), 1);
        assert_eq!(result.failed_to_send_to[0].0, b);
    }
}
