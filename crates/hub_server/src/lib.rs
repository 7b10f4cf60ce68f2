//! # Hub Server
//!
//! WebSocket transport between the hub and its nodes. Each node opens one
//! WebSocket, announces its name in a text frame, and then exchanges binary
//! frames carrying `channel + message` with the hub. Inbound frames are fed
//! to a [`player_sync::MessageBus`]; the [`NodeRegistry`] is the bus's
//! [`player_sync::NodeSender`], so responses and broadcasts travel back over
//! the same sockets.

pub mod error;
pub mod frame;
pub mod registry;
pub mod server;

pub use error::HubError;
pub use frame::{decode_frame, encode_frame};
pub use registry::{NodeLink, NodeRegistry};
pub use server::{HubServer, HubServerConfig};
