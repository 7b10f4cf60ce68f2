//! Durable persistence of player state.
//!
//! [`PlayerStore`] is the seam the cache and handlers talk to. Both
//! implementations reach their backend only through a
//! [`ConnectionSupervisor`], so every operation fails fast with
//! [`StoreError::NoActiveConnection`](crate::StoreError::NoActiveConnection)
//! while the connection is being repaired.

mod memory;
mod sql;
mod supervisor;
mod value;

pub use memory::{MemoryConnection, MemoryConnector, MemoryDatabase, MemoryPlayerStore, MemoryTables};
pub use sql::{MySqlConnector, MySqlSettings, SqlPlayerStore};
pub use supervisor::{ConnectionState, ConnectionSupervisor, Connector, StoreConnection, SupervisorConfig};
pub use value::StoreValue;

use crate::error::StoreError;
use crate::types::{PlayerId, PlayerState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Table holding one row per player.
pub const PLAYERS_TABLE: &str = "grivyzom_players";
/// Table holding one row per registered node.
pub const NODES_TABLE: &str = "grivyzom_servers";
/// Table holding plugin key/value data.
pub const PLUGIN_DATA_TABLE: &str = "grivyzom_plugin_data";

/// Row counts across the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_players: i64,
    pub online_players: i64,
    pub total_nodes: i64,
    pub plugin_data_entries: i64,
}

/// Read and write access to persisted player state.
///
/// Not-found is `Ok(None)`, never an error. No operation retries on its
/// own; callers decide what a failure means.
#[async_trait]
pub trait PlayerStore: Send + Sync + 'static {
    async fn load_by_id(&self, id: PlayerId) -> Result<Option<PlayerState>, StoreError>;

    /// Case-insensitive lookup by login name.
    async fn load_by_name(&self, name: &str) -> Result<Option<PlayerState>, StoreError>;

    /// Inserts the player, or on an existing row updates only username,
    /// display name, last-seen and the online flag (set to `true`).
    async fn upsert_on_session_start(&self, state: &PlayerState) -> Result<(), StoreError>;

    /// Sets the online flag and stamps `at` as the last-seen time.
    async fn set_online_status(
        &self,
        id: PlayerId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_last_node(&self, id: PlayerId, node: &str) -> Result<(), StoreError>;

    async fn set_coins(&self, id: PlayerId, coins: f64) -> Result<(), StoreError>;

    async fn set_gems(&self, id: PlayerId, gems: i32) -> Result<(), StoreError>;

    async fn set_rank(&self, id: PlayerId, rank_id: &str) -> Result<(), StoreError>;

    /// Writes balances, rank, permissions, extension data, playtime and the
    /// last node of an existing row.
    async fn save_full(&self, state: &PlayerState) -> Result<(), StoreError>;

    /// Up to `limit` players by coins descending, ties broken by identifier
    /// ascending. A non-positive limit yields an empty list.
    async fn top_by_coins(&self, limit: i32) -> Result<Vec<PlayerState>, StoreError>;

    /// Reads one plugin value. `player` is `None` for plugin-global keys.
    async fn get_plugin_data(
        &self,
        plugin: &str,
        player: Option<PlayerId>,
        key: &str,
    ) -> Result<Option<StoreValue>, StoreError>;

    /// Writes one plugin value, replacing any previous value for the same
    /// `(plugin, player, key)`.
    async fn set_plugin_data(
        &self,
        plugin: &str,
        player: Option<PlayerId>,
        key: &str,
        value: &StoreValue,
    ) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Creates the tables if they do not exist yet.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Probes the underlying connection. Never errors.
    async fn is_healthy(&self) -> bool;
}
