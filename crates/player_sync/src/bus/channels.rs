//! Channel names, families and the registry of accepted message types.

use crate::protocol::*;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info};

pub const CORE_CHANNEL: &str = "grivyzom:core";
pub const ECONOMY_CHANNEL: &str = "grivyzom:economy";
pub const RANKUP_CHANNEL: &str = "grivyzom:rankup";
pub const PVP_CHANNEL: &str = "grivyzom:pvp";
pub const SESSION_CHANNEL: &str = "grivyzom:session";

/// Groups channels that share a handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelFamily {
    Core,
    Economy,
    Rankup,
    Pvp,
    Session,
}

impl std::fmt::Display for ChannelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Core => "core",
            Self::Economy => "economy",
            Self::Rankup => "rankup",
            Self::Pvp => "pvp",
            Self::Session => "session",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct ChannelEntry {
    family: ChannelFamily,
    accepted: HashSet<String>,
}

/// Maps each registered channel to its family and the message types it
/// accepts.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The channels every hub registers at startup.
    pub fn default_channels() -> Vec<(&'static str, ChannelFamily, Vec<&'static str>)> {
        let economy = vec![GET_PLAYER_DATA, UPDATE_COINS, UPDATE_GEMS, GET_TOP_PLAYERS];
        let mut core = economy.clone();
        core.extend([PING, STATUS_REQUEST]);

        vec![
            (CORE_CHANNEL, ChannelFamily::Core, core),
            (ECONOMY_CHANNEL, ChannelFamily::Economy, economy),
            (RANKUP_CHANNEL, ChannelFamily::Rankup, vec![UPDATE_RANK]),
            (PVP_CHANNEL, ChannelFamily::Pvp, vec![SYNC_PLAYER_DATA]),
            (
                SESSION_CHANNEL,
                ChannelFamily::Session,
                vec![SESSION_START, SESSION_END, NODE_SWITCH],
            ),
        ]
    }

    pub fn register(&self, name: &str, family: ChannelFamily, accepted: &[&str]) {
        let entry = ChannelEntry {
            family,
            accepted: accepted.iter().map(|t| t.to_string()).collect(),
        };
        self.write().insert(name.to_string(), entry);
        info!("📡 Registered channel {} ({} family, {} message types)", name, family, accepted.len());
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.write().remove(name).is_some();
        if removed {
            debug!("Unregistered channel {}", name);
        }
        removed
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn family_of(&self, name: &str) -> Option<ChannelFamily> {
        self.read().get(name).map(|entry| entry.family)
    }

    /// The channel's family if the channel is registered and accepts
    /// `message_type`.
    pub fn route(&self, name: &str, message_type: &str) -> Option<ChannelFamily> {
        self.read()
            .get(name)
            .filter(|entry| entry.accepted.contains(message_type))
            .map(|entry| entry.family)
    }

    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ChannelEntry>> {
        self.channels.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ChannelEntry>> {
        self.channels.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
