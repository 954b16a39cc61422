//! Authenticated receive loop
//!
//! Reads server pushes from the authenticated socket. Each
//! `PUT /api/v1/message` carries one `Envelope`; it is decrypted through the
//! engine and handed to an [`EnvelopeHandler`]. Every server request gets
//! exactly one response: `200` once handled, `400` otherwise.

use super::traits::*;
use super::transport::{Frame, FrameTransport, RequestEnvelope, ResponseEnvelope, TransportError};
use crate::proto::{envelope, Content, Envelope};
use async_trait::async_trait;
use prost::Message;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MESSAGE_PATH: &str = "/api/v1/message";
pub const QUEUE_EMPTY_PATH: &str = "/api/v1/queue/empty";

/// A decrypted text message from the encrypted network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender: ServiceId,
    pub source_device: u32,
    /// Local account the message was addressed to
    pub receiver: ServiceId,
    pub group: Option<GroupId>,
    pub body: String,
    pub timestamp: u64,
}

/// Consumer of decrypted inbound messages.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle_message(&self, message: ReceivedMessage) -> SignalResult<()>;
}

/// What became of one pushed request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    Handled,
    Skipped(&'static str),
    Rejected(String),
}

pub struct ReceiveLoop {
    transport: Box<dyn FrameTransport>,
    dispatcher: Dispatcher,
}

/// Everything but the socket. Kept apart so the socket is never borrowed
/// while a handler runs.
struct Dispatcher {
    engine: Arc<dyn ProtocolEngine>,
    handler: Arc<dyn EnvelopeHandler>,
    receiver: ServiceId,
}

impl ReceiveLoop {
    pub fn new(
        transport: Box<dyn FrameTransport>,
        engine: Arc<dyn ProtocolEngine>,
        handler: Arc<dyn EnvelopeHandler>,
        receiver: ServiceId,
    ) -> Self {
        Self {
            transport,
            dispatcher: Dispatcher {
                engine,
                handler,
                receiver,
            },
        }
    }

    /// Run until the socket closes. A clean close returns `Ok`.
    pub async fn run(self) -> Result<(), TransportError> {
        let ReceiveLoop {
            mut transport,
            dispatcher,
        } = self;
        info!("Receive loop started for {}", dispatcher.receiver);
        loop {
            let frame = match transport.receive().await {
                Ok(frame) => frame,
                Err(TransportError::Closed) => {
                    info!("Authenticated socket closed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let request = match frame {
                Frame::Request(request) => request,
                Frame::Response(response) => {
                    debug!("Ignoring response {} on receive loop", response.id);
                    continue;
                }
            };

            let response = match dispatcher.dispatch(&request).await {
                Disposition::Handled => ResponseEnvelope::ok(request.id),
                Disposition::Skipped(reason) => {
                    debug!("Skipped {} {}: {}", request.verb, request.path, reason);
                    ResponseEnvelope::ok(request.id)
                }
                Disposition::Rejected(reason) => {
                    warn!("Rejected {} {}: {}", request.verb, request.path, reason);
                    ResponseEnvelope::bad_request(request.id)
                }
            };
            transport.send(Frame::Response(response)).await?;
        }
    }
}

impl Dispatcher {
    async fn dispatch(&self, request: &RequestEnvelope) -> Disposition {
        if request.is("PUT", QUEUE_EMPTY_PATH) {
            debug!("Server queue drained");
            return Disposition::Handled;
        }
        if !request.is("PUT", MESSAGE_PATH) {
            return Disposition::Rejected("unexpected request".to_string());
        }

        let envelope = match Envelope::decode(request.body.as_slice()) {
            Ok(envelope) => envelope,
            Err(e) => return Disposition::Rejected(format!("undecodable envelope: {}", e)),
        };

        match self.open(&envelope) {
            Ok(Some(message)) => match self.handler.handle_message(message).await {
                Ok(()) => Disposition::Handled,
                Err(e) => Disposition::Rejected(format!("handler failed: {}", e)),
            },
            Ok(None) => Disposition::Skipped("no text content"),
            Err(e) => Disposition::Rejected(e.to_string()),
        }
    }

    /// Decrypt and unpack one envelope. `Ok(None)` for envelopes that carry
    /// nothing to route.
    fn open(&self, envelope: &Envelope) -> SignalResult<Option<ReceivedMessage>> {
        let sender = ServiceId(envelope.source_service_id.clone());

        let plaintext = match envelope::Type::try_from(envelope.r#type) {
            Ok(envelope::Type::Ciphertext) | Ok(envelope::Type::PrekeyBundle) => {
                if sender.0.is_empty() {
                    return Err(SignalError::InvalidMessage(
                        "ciphertext without source".to_string(),
                    ));
                }
                self.engine.decrypt_session(&sender, &envelope.content)?
            }
            Ok(envelope::Type::PlaintextContent) => envelope.content.clone(),
            Ok(envelope::Type::Receipt) => return Ok(None),
            Ok(other) => {
                debug!("Unsupported envelope type {:?}", other);
                return Ok(None);
            }
            Err(_) => {
                return Err(SignalError::InvalidMessage(format!(
                    "unknown envelope type {}",
                    envelope.r#type
                )))
            }
        };

        let content = Content::decode(plaintext.as_slice())
            .map_err(|e| SignalError::InvalidMessage(format!("undecodable content: {}", e)))?;
        let Some(data) = content.data_message else {
            return Ok(None);
        };
        if data.body.is_empty() {
            return Ok(None);
        }

        Ok(Some(ReceivedMessage {
            sender,
            source_device: envelope.source_device,
            receiver: self.receiver.clone(),
            group: data
                .group_v2
                .filter(|g| !g.master_key.is_empty())
                .map(|g| GroupId(g.master_key)),
            body: data.body,
            timestamp: if data.timestamp != 0 {
                data.timestamp
            } else {
                envelope.timestamp
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{DataMessage, GroupContextV2};
    use crate::signal::engine::SoftwareEngine;
    use crate::signal::keys::IdentityKeyPair;
    use crate::signal::mock::channel_transport;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<ReceivedMessage>>,
    }

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        async fn handle_message(&self, message: ReceivedMessage) -> SignalResult<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn text(body: &str, group: Option<Vec<u8>>) -> Vec<u8> {
        Content {
            data_message: Some(DataMessage {
                body: body.to_string(),
                timestamp: 1234,
                group_v2: group.map(|master_key| GroupContextV2 {
                    master_key,
                    revision: 0,
                }),
            }),
        }
        .encode_to_vec()
    }

    fn push(id: u64, envelope: Envelope) -> Frame {
        Frame::Request(
            RequestEnvelope::new(id, "PUT", MESSAGE_PATH).with_body(envelope.encode_to_vec()),
        )
    }

    /// Handler that yields mid-message, so the loop's future is held across
    /// an await while the runtime may move it between threads.
    #[derive(Default)]
    struct SlowRecorder {
        bodies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EnvelopeHandler for SlowRecorder {
        async fn handle_message(&self, message: ReceivedMessage) -> SignalResult<()> {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.bodies.lock().unwrap().push(message.body);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_receive_loop_runs_as_task_on_worker_threads() {
        let (client, mut server) = channel_transport();
        let handler = Arc::new(SlowRecorder::default());
        let task = tokio::spawn(
            ReceiveLoop::new(
                Box::new(client),
                Arc::new(SoftwareEngine::new()),
                handler.clone(),
                ServiceId::from("bob"),
            )
            .run(),
        );

        for id in 1..=3u64 {
            server
                .send(push(
                    id,
                    Envelope {
                        r#type: envelope::Type::PlaintextContent as i32,
                        source_service_id: "alice".to_string(),
                        content: text(&format!("m{}", id), None),
                        ..Default::default()
                    },
                ))
                .await
                .unwrap();
            assert_eq!(
                server.receive().await.unwrap(),
                Frame::Response(ResponseEnvelope::ok(id))
            );
        }

        drop(server);
        task.await.unwrap().unwrap();
        assert_eq!(*handler.bodies.lock().unwrap(), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_receive_loop_decrypts_and_acknowledges() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let (alice_id, bob_id) = (ServiceId::from("alice"), ServiceId::from("bob"));

        let alice_engine = SoftwareEngine::new();
        alice_engine
            .establish_session(&alice, &bob_id, &bob.public_key())
            .unwrap();
        let bob_engine = Arc::new(SoftwareEngine::new());
        bob_engine
            .establish_session(&bob, &alice_id, &alice.public_key())
            .unwrap();

        let (client, mut server) = channel_transport();
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn(
            ReceiveLoop::new(Box::new(client), bob_engine, recorder.clone(), bob_id.clone()).run(),
        );

        let ciphertext = alice_engine
            .encrypt_session(&bob_id, &text("hello", Some(vec![7; 32])))
            .unwrap();
        server
            .send(push(
                5,
                Envelope {
                    r#type: envelope::Type::Ciphertext as i32,
                    source_service_id: "alice".to_string(),
                    source_device: 1,
                    content: ciphertext,
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        assert_eq!(
            server.receive().await.unwrap(),
            Frame::Response(ResponseEnvelope::ok(5))
        );

        server
            .send(Frame::Request(RequestEnvelope::new(6, "PUT", QUEUE_EMPTY_PATH)))
            .await
            .unwrap();
        assert_eq!(
            server.receive().await.unwrap(),
            Frame::Response(ResponseEnvelope::ok(6))
        );

        drop(server);
        task.await.unwrap().unwrap();

        let messages = recorder.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, alice_id);
        assert_eq!(messages[0].receiver, bob_id);
        assert_eq!(messages[0].body, "hello");
        assert_eq!(messages[0].group, Some(GroupId(vec![7; 32])));
        assert_eq!(messages[0].timestamp, 1234);
    }

    #[tokio::test]
    async fn test_receive_loop_rejects_bad_input() {
        let (client, mut server) = channel_transport();
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn(
            ReceiveLoop::new(
                Box::new(client),
                Arc::new(SoftwareEngine::new()),
                recorder.clone(),
                ServiceId::from("bob"),
            )
            .run(),
        );

        // No session with the sender.
        server
            .send(push(
                1,
                Envelope {
                    r#type: envelope::Type::Ciphertext as i32,
                    source_service_id: "mallory".to_string(),
                    content: vec![1, 2, 3],
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        assert_eq!(
            server.receive().await.unwrap(),
            Frame::Response(ResponseEnvelope::bad_request(1))
        );

        server
            .send(Frame::Request(
                RequestEnvelope::new(2, "PUT", MESSAGE_PATH).with_body(vec![0xff, 0xff]),
            ))
            .await
            .unwrap();
        assert_eq!(
            server.receive().await.unwrap(),
            Frame::Response(ResponseEnvelope::bad_request(2))
        );

        server
            .send(Frame::Request(RequestEnvelope::new(3, "GET", "/v1/unknown")))
            .await
            .unwrap();
        assert_eq!(
            server.receive().await.unwrap(),
            Frame::Response(ResponseEnvelope::bad_request(3))
        );

        drop(server);
        task.await.unwrap().unwrap();
        assert!(recorder.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plaintext_without_body_is_acknowledged_and_skipped() {
        let (client, mut server) = channel_transport();
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn(
            ReceiveLoop::new(
                Box::new(client),
                Arc::new(SoftwareEngine::new()),
                recorder.clone(),
                ServiceId::from("bob"),
            )
            .run(),
        );

        server
            .send(push(
                9,
                Envelope {
                    r#type: envelope::Type::PlaintextContent as i32,
                    source_service_id: "alice".to_string(),
                    content: text("", None),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        assert_eq!(
            server.receive().await.unwrap(),
            Frame::Response(ResponseEnvelope::ok(9))
        );

        drop(server);
        task.await.unwrap().unwrap();
        assert!(recorder.messages.lock().unwrap().is_empty());
    }
}
