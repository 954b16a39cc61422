//! Federated-network side of the bridge
//!
//! Conversation routing actors ("portals"), the registry that owns them,
//! and the traits the federated network is reached through.

pub mod mock;
pub mod portal;
pub mod registry;
pub mod traits;
pub mod types;

pub use portal::{Portal, PortalConfig, PortalHandle, RoomIndex};
pub use registry::PortalRegistry;
pub use traits::{BridgeError, BridgeResult, FederatedClient, MessageStore};
pub use types::*;
