//! Signal Protocol Integration Module
//!
//! The encrypted-network side of the bridge:
//! - Device linking (provisioning handshake, key registration)
//! - Websocket framing for the chat service
//! - Authenticated receive loop and engine-backed sending
//! - The `ProtocolEngine` capability and a software implementation

pub mod engine;
pub mod keys;
pub mod linking;
pub mod mock;
pub mod prekeys;
pub mod provisioning;
pub mod receiver;
pub mod registration;
pub mod retry;
pub mod sender;
pub mod store;
pub mod traits;
pub mod transport;

#[cfg(test)]
mod proptests;

pub use engine::SoftwareEngine;
pub use linking::{
    LinkingConfig, ProvisioningError, ProvisioningEvent, ProvisioningObserver,
    ProvisioningPipeline, ProvisioningState,
};
pub use receiver::{EnvelopeHandler, ReceiveLoop, ReceivedMessage};
pub use sender::EngineSender;
pub use store::{AccountId, Credentials, DeviceCredential, FileDeviceStore, MemoryDeviceStore};
pub use traits::{
    DeviceStore, EngineError, GroupId, IdentityKind, KeyRegistrar, ProtocolEngine, ServiceId,
    SignalError, SignalResult, SignalSender,
};
pub use transport::{Connector, WebSocketConnector};
