//! # Player Sync
//!
//! The player-state synchronization layer of the Grivyzom hub. It keeps one
//! canonical, mutable record per connected player, persists it through a
//! supervised store connection, and lets the nodes of the network read and
//! mutate that state through short binary messages on named channels.
//!
//! ## Components
//!
//! * [`wire`] - the tag-prefixed binary codec shared by every channel
//! * [`protocol`] - the typed message catalog built on top of the codec
//! * [`store`] - the [`ConnectionSupervisor`] and the [`PlayerStore`] seam with
//!   a MySQL implementation and an in-memory one
//! * [`cache`] - the concurrent [`PlayerCache`] that is authoritative for
//!   online players
//! * [`bus`] - the [`MessageBus`] that registers channels and dispatches
//!   inbound messages to handlers by `(channel family, message type)`
//!
//! ## Wiring
//!
//! Nothing in this crate is reachable through a global. Every component is
//! constructed with the handles it needs:
//!
//! ```rust,no_run
//! use player_sync::*;
//! use std::sync::Arc;
//!
//! # async fn wire(sender: Arc<dyn NodeSender>) -> Result<(), Box<dyn std::error::Error>> {
//! let database = Arc::new(MemoryDatabase::new());
//! let supervisor = ConnectionSupervisor::connect(
//!     MemoryConnector::new(database),
//!     SupervisorConfig::default(),
//! ).await?;
//! supervisor.start_health_monitor().await;
//!
//! let store: Arc<dyn PlayerStore> = Arc::new(MemoryPlayerStore::new(supervisor.clone()));
//! let cache = Arc::new(PlayerCache::new(store));
//!
//! let bus = Arc::new(MessageBus::new(sender));
//! register_player_handlers(&bus, cache.clone(), HandlerSettings::default()).await?;
//! bus.register_channels();
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cache;
pub mod error;
pub mod protocol;
pub mod store;
pub mod types;
pub mod wire;

pub use bus::{
    register_player_handlers, BroadcastReport, BusStats, ChannelFamily, ChannelRegistry,
    HandlerSettings, InboundMessage, MessageBus, NodeSender, Outbound, CORE_CHANNEL,
    ECONOMY_CHANNEL, PVP_CHANNEL, RANKUP_CHANNEL, SESSION_CHANNEL,
};
pub use cache::{CacheStats, FlushReport, PlayerCache};
pub use error::{BusError, StoreError, WireError};
pub use protocol::{PlayerDataResponse, Request, Response, TopPlayerEntry};
pub use store::{
    ConnectionState, ConnectionSupervisor, Connector, MemoryConnection, MemoryConnector,
    MemoryDatabase, MemoryPlayerStore, MemoryTables, MySqlConnector, MySqlSettings, PlayerStore,
    SqlPlayerStore, StoreConnection, StoreStats, StoreValue, SupervisorConfig,
};
pub use types::{now_seconds, BalanceChange, PlayerId, PlayerState, DEFAULT_RANK};
pub use wire::{FieldKind, WireMessage, WireReader, WireValue, WireWriter};
