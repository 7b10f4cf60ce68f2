//! Player identity and the per-player state record.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rank assigned to players that have never been promoted.
pub const DEFAULT_RANK: &str = "default";

/// Unique identifier for a player across every node of the network.
///
/// This is a wrapper around UUID so player IDs cannot be confused with
/// other identifiers. It is immutable and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Creates a new random player ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a player ID from its hyphenated string form.
    pub fn from_str(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current UTC time truncated to whole seconds.
///
/// The backing store keeps second-precision timestamps, so every timestamp
/// placed on a [`PlayerState`] goes through here.
pub fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// The canonical state record of one player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: PlayerId,
    /// Login name, matched case-insensitively by name lookups.
    pub username: String,
    pub display_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Name of the node the player was last connected to.
    pub last_node: Option<String>,
    /// Cumulative online time in milliseconds.
    pub total_playtime_ms: i64,
    /// Primary currency. Non-negative by policy.
    pub coins: f64,
    /// Secondary currency. Non-negative by policy.
    pub gems: i32,
    pub rank_id: String,
    /// Serialized permission data, opaque to this layer.
    pub permissions: Option<String>,
    /// Serialized extension data, opaque to this layer.
    pub extra_data: Option<String>,
    pub online: bool,
}

impl PlayerState {
    /// State for a player seen for the first time: zero balances, the
    /// default rank, and the chosen name as both username and display name.
    pub fn bootstrap(id: PlayerId, name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            username: name.to_string(),
            display_name: name.to_string(),
            first_seen: now,
            last_seen: now,
            last_node: None,
            total_playtime_ms: 0,
            coins: 0.0,
            gems: 0,
            rank_id: DEFAULT_RANK.to_string(),
            permissions: None,
            extra_data: None,
            online: true,
        }
    }

    pub fn add_coins(&mut self, amount: f64) {
        self.coins += amount;
    }

    /// Removes coins if the balance covers the amount. Returns `false` and
    /// leaves the balance untouched otherwise.
    pub fn remove_coins(&mut self, amount: f64) -> bool {
        if self.coins >= amount {
            self.coins -= amount;
            true
        } else {
            false
        }
    }

    pub fn add_gems(&mut self, amount: i32) {
        self.gems = self.gems.saturating_add(amount);
    }

    /// Removes gems if the balance covers the amount. Returns `false` and
    /// leaves the balance untouched otherwise.
    pub fn remove_gems(&mut self, amount: i32) -> bool {
        if self.gems >= amount {
            self.gems -= amount;
            true
        } else {
            false
        }
    }

    pub fn has_enough_coins(&self, amount: f64) -> bool {
        self.coins >= amount
    }

    pub fn has_enough_gems(&self, amount: i32) -> bool {
        self.gems >= amount
    }

    pub fn add_playtime(&mut self, millis: i64) {
        self.total_playtime_ms = self.total_playtime_ms.saturating_add(millis.max(0));
    }

    /// Playtime as `"1h 2m 3s"`, `"2m 3s"` or `"3s"`.
    pub fn formatted_playtime(&self) -> String {
        let total_seconds = self.total_playtime_ms / 1000;
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;

        if hours > 0 {
            format!("{hours}h {minutes}m {seconds}s")
        } else if minutes > 0 {
            format!("{minutes}m {seconds}s")
        } else {
            format!("{seconds}s")
        }
    }
}

/// A balance mutation: either an absolute value or a delta.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BalanceChange<T> {
    Set(T),
    Add(T),
}

impl BalanceChange<f64> {
    pub fn apply(self, current: f64) -> f64 {
        match self {
            Self::Set(value) => value,
            Self::Add(delta) => current + delta,
        }
    }
}

impl BalanceChange<i32> {
    pub fn apply(self, current: i32) -> i32 {
        match self {
            Self::Set(value) => value,
            Self::Add(delta) => current.saturating_add(delta),
        }
    }
}
