//! Transport Framing Layer
//!
//! One websocket binary message carries exactly one encoded
//! `WebSocketMessage`. Correlation is by request `id` only; this layer does
//! not retry, deduplicate or reorder.

use crate::proto::{web_socket_message, WebSocketMessage, WebSocketRequestMessage, WebSocketResponseMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

pub const PROVISIONING_PATH: &str = "/v1/websocket/provisioning/";
pub const WEBSOCKET_PATH: &str = "/v1/websocket/";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Socket error: {0}")]
    Io(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Undecodable frame: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub id: u64,
    pub verb: String,
    pub path: String,
    pub body: Vec<u8>,
    pub headers: Vec<String>,
}

impl RequestEnvelope {
    pub fn new(id: u64, verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id,
            verb: verb.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(format!("{}: {}", name, value));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|h| {
            let (key, value) = h.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    pub fn is(&self, verb: &str, path: &str) -> bool {
        self.verb.eq_ignore_ascii_case(verb) && self.path == path
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub status: u32,
    pub message: String,
    pub headers: Vec<String>,
    pub body: Vec<u8>,
}

impl ResponseEnvelope {
    pub fn new(id: u64, status: u32, message: impl Into<String>) -> Self {
        Self {
            id,
            status,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn ok(id: u64) -> Self {
        Self::new(id, 200, "OK")
    }

    pub fn bad_request(id: u64) -> Self {
        Self::new(id, 400, "Bad Request")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl From<Frame> for WebSocketMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Request(r) => WebSocketMessage {
                r#type: web_socket_message::Type::Request as i32,
                request: Some(WebSocketRequestMessage {
                    verb: r.verb,
                    path: r.path,
                    body: r.body,
                    id: r.id,
                    headers: r.headers,
                }),
                response: None,
            },
            Frame::Response(r) => WebSocketMessage {
                r#type: web_socket_message::Type::Response as i32,
                request: None,
                response: Some(WebSocketResponseMessage {
                    id: r.id,
                    status: r.status,
                    message: r.message,
                    body: r.body,
                    headers: r.headers,
                }),
            },
        }
    }
}

impl TryFrom<WebSocketMessage> for Frame {
    type Error = TransportError;

    fn try_from(message: WebSocketMessage) -> Result<Self, Self::Error> {
        match web_socket_message::Type::try_from(message.r#type) {
            Ok(web_socket_message::Type::Request) => {
                let r = message
                    .request
                    .ok_or_else(|| TransportError::Codec("REQUEST without request".to_string()))?;
                Ok(Frame::Request(RequestEnvelope {
                    id: r.id,
                    verb: r.verb,
                    path: r.path,
                    body: r.body,
                    headers: r.headers,
                }))
            }
            Ok(web_socket_message::Type::Response) => {
                let r = message
                    .response
                    .ok_or_else(|| TransportError::Codec("RESPONSE without response".to_string()))?;
                Ok(Frame::Response(ResponseEnvelope {
                    id: r.id,
                    status: r.status,
                    message: r.message,
                    headers: r.headers,
                    body: r.body,
                }))
            }
            _ => Err(TransportError::Codec(format!(
                "unknown message type {}",
                message.r#type
            ))),
        }
    }
}

pub fn encode_frame(frame: Frame) -> Vec<u8> {
    WebSocketMessage::from(frame).encode_to_vec()
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, TransportError> {
    let message =
        WebSocketMessage::decode(bytes).map_err(|e| TransportError::Codec(e.to_string()))?;
    Frame::try_from(message)
}

/// One long-lived duplex connection.
#[async_trait]
pub trait FrameTransport: Send {
    /// Write one frame atomically.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Wait for the next complete frame.
    async fn receive(&mut self) -> Result<Frame, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports to the chat service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// `path` may carry a query string.
    async fn connect(&self, path: &str) -> Result<Box<dyn FrameTransport>, TransportError>;
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameTransport for WebSocketTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.stream
            .send(Message::Binary(encode_frame(frame)))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Frame, TransportError> {
        loop {
            let message = self
                .stream
                .next()
                .await
                .ok_or(TransportError::Closed)?
                .map_err(|e| TransportError::Io(e.to_string()))?;

            match message {
                Message::Binary(bytes) => return decode_frame(&bytes),
                Message::Close(_) => return Err(TransportError::Closed),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => {
                    warn!("Ignoring non-binary websocket message ({} bytes)", other.len());
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Connects to `wss://<host>/<path>` with tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base: Url,
}

impl WebSocketConnector {
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    pub fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        self.base.join(path).map_err(|e| TransportError::Connect {
            url: format!("{}{}", self.base, path),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, path: &str) -> Result<Box<dyn FrameTransport>, TransportError> {
        let url = self.url_for(path)?;
        debug!("Connecting to {}{}", url.host_str().unwrap_or_default(), url.path());

        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: format!("{}{}", url.host_str().unwrap_or_default(), url.path()),
                reason: e.to_string(),
            })?;
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

/// Send `request` and wait for the response carrying its id.
///
/// Requests the peer sends meanwhile are answered `400`; responses to other
/// ids are dropped.
pub async fn exchange(
    transport: &mut dyn FrameTransport,
    request: RequestEnvelope,
) -> Result<ResponseEnvelope, TransportError> {
    let id = request.id;
    transport.send(Frame::Request(request)).await?;

    loop {
        match transport.receive().await? {
            Frame::Response(response) if response.id == id => return Ok(response),
            Frame::Response(response) => {
                debug!("Dropping response for unknown request {}", response.id);
            }
            Frame::Request(unexpected) => {
                warn!(
                    "Unexpected {} {} while awaiting response {}",
                    unexpected.verb, unexpected.path, id
                );
                transport
                    .send(Frame::Response(ResponseEnvelope::bad_request(unexpected.id)))
                    .await?;
            }
        }
    }
}
