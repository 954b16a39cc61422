//! Bridgehead - Signal ↔ federated chat bridge
//!
//! Links itself as a secondary Signal device, then relays messages between
//! Signal conversations and federated rooms.
//!
//! Key principles:
//! - One-shot, observable linking handshake
//! - One serialized routing actor per conversation
//! - Delivery records written exactly once per routed message

pub mod bridge;
pub mod proto;
pub mod signal;
