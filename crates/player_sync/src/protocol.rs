//! The typed message catalog exchanged between the hub and its nodes.
//!
//! Requests arrive from nodes; responses are sent back on a fixed channel
//! per response type. Field order on the wire is exactly the order of the
//! struct fields below.

use crate::bus::{CORE_CHANNEL, ECONOMY_CHANNEL};
use crate::error::WireError;
use crate::types::{PlayerId, PlayerState};
use crate::wire::{WireMessage, WireReader, WireWriter};

// Requests
pub const GET_PLAYER_DATA: &str = "GET_PLAYER_DATA";
pub const UPDATE_COINS: &str = "UPDATE_COINS";
pub const UPDATE_GEMS: &str = "UPDATE_GEMS";
pub const GET_TOP_PLAYERS: &str = "GET_TOP_PLAYERS";
pub const UPDATE_RANK: &str = "UPDATE_RANK";
pub const SYNC_PLAYER_DATA: &str = "SYNC_PLAYER_DATA";
pub const PING: &str = "PING";
pub const STATUS_REQUEST: &str = "STATUS_REQUEST";
pub const SESSION_START: &str = "SESSION_START";
pub const SESSION_END: &str = "SESSION_END";
pub const NODE_SWITCH: &str = "NODE_SWITCH";

// Responses
pub const PLAYER_DATA_RESPONSE: &str = "PLAYER_DATA_RESPONSE";
pub const TOP_PLAYERS_RESPONSE: &str = "TOP_PLAYERS_RESPONSE";
pub const PONG: &str = "PONG";
pub const STATUS_RESPONSE: &str = "STATUS_RESPONSE";

// Broadcasts
pub const PLAYER_UPDATE: &str = "PLAYER_UPDATE";
pub const MAINTENANCE: &str = "MAINTENANCE";

/// `PLAYER_UPDATE(uuid, kind)`: tells every node that one attribute of a
/// player changed, so cached copies on nodes can be refreshed.
pub fn player_update(player: PlayerId, kind: &str) -> WireMessage {
    WireMessage::new(PLAYER_UPDATE)
        .with(player.to_string())
        .with(kind)
}

/// `MAINTENANCE("START" | "END")`.
pub fn maintenance(starting: bool) -> WireMessage {
    WireMessage::new(MAINTENANCE).with(if starting { "START" } else { "END" })
}

fn read_player_id(reader: &mut WireReader) -> Result<PlayerId, WireError> {
    let raw = reader.read_str()?;
    PlayerId::from_str(&raw).map_err(|e| WireError::InvalidField {
        field: "uuid",
        reason: format!("'{raw}': {e}"),
    })
}

/// A request sent by a node to the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetPlayerData { player: PlayerId },
    UpdateCoins { player: PlayerId, coins: f64 },
    UpdateGems { player: PlayerId, gems: i32 },
    GetTopPlayers { limit: i32 },
    UpdateRank { player: PlayerId, rank_id: String },
    SyncPlayerData { player: PlayerId },
    Ping { timestamp: i64 },
    StatusRequest { timestamp: i64 },
    SessionStart { player: PlayerId, username: String },
    SessionEnd { player: PlayerId },
    NodeSwitch { player: PlayerId, node: String },
}

impl Request {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::GetPlayerData { .. } => GET_PLAYER_DATA,
            Self::UpdateCoins { .. } => UPDATE_COINS,
            Self::UpdateGems { .. } => UPDATE_GEMS,
            Self::GetTopPlayers { .. } => GET_TOP_PLAYERS,
            Self::UpdateRank { .. } => UPDATE_RANK,
            Self::SyncPlayerData { .. } => SYNC_PLAYER_DATA,
            Self::Ping { .. } => PING,
            Self::StatusRequest { .. } => STATUS_REQUEST,
            Self::SessionStart { .. } => SESSION_START,
            Self::SessionEnd { .. } => SESSION_END,
            Self::NodeSwitch { .. } => NODE_SWITCH,
        }
    }

    /// Decodes the fields of a request whose tag has already been read.
    pub fn decode_fields(message_type: &str, reader: &mut WireReader) -> Result<Self, WireError> {
        Ok(match message_type {
            GET_PLAYER_DATA => Self::GetPlayerData {
                player: read_player_id(reader)?,
            },
            UPDATE_COINS => Self::UpdateCoins {
                player: read_player_id(reader)?,
                coins: reader.read_f64()?,
            },
            UPDATE_GEMS => Self::UpdateGems {
                player: read_player_id(reader)?,
                gems: reader.read_i32()?,
            },
            GET_TOP_PLAYERS => Self::GetTopPlayers {
                limit: reader.read_i32()?,
            },
            UPDATE_RANK => Self::UpdateRank {
                player: read_player_id(reader)?,
                rank_id: reader.read_str()?,
            },
            SYNC_PLAYER_DATA => Self::SyncPlayerData {
                player: read_player_id(reader)?,
            },
            PING => Self::Ping {
                timestamp: reader.read_i64()?,
            },
            STATUS_REQUEST => Self::StatusRequest {
                timestamp: reader.read_i64()?,
            },
            SESSION_START => Self::SessionStart {
                player: read_player_id(reader)?,
                username: reader.read_str()?,
            },
            SESSION_END => Self::SessionEnd {
                player: read_player_id(reader)?,
            },
            NODE_SWITCH => Self::NodeSwitch {
                player: read_player_id(reader)?,
                node: reader.read_str()?,
            },
            other => return Err(WireError::UnknownMessageType(other.to_string())),
        })
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let (message_type, mut reader) = WireReader::split_tag(raw)?;
        Self::decode_fields(&message_type, &mut reader)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = WireWriter::with_tag(self.message_type())?;
        match self {
            Self::GetPlayerData { player }
            | Self::SyncPlayerData { player }
            | Self::SessionEnd { player } => {
                writer.write_str(&player.to_string())?;
            }
            Self::UpdateCoins { player, coins } => {
                writer.write_str(&player.to_string())?;
                writer.write_f64(*coins);
            }
            Self::UpdateGems { player, gems } => {
                writer.write_str(&player.to_string())?;
                writer.write_i32(*gems);
            }
            Self::GetTopPlayers { limit } => writer.write_i32(*limit),
            Self::UpdateRank { player, rank_id } => {
                writer.write_str(&player.to_string())?;
                writer.write_str(rank_id)?;
            }
            Self::Ping { timestamp } | Self::StatusRequest { timestamp } => {
                writer.write_i64(*timestamp);
            }
            Self::SessionStart { player, username } => {
                writer.write_str(&player.to_string())?;
                writer.write_str(username)?;
            }
            Self::NodeSwitch { player, node } => {
                writer.write_str(&player.to_string())?;
                writer.write_str(node)?;
            }
        }
        Ok(writer.into_bytes())
    }
}

/// Snapshot of one player as sent to nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerDataResponse {
    pub uuid: String,
    pub username: String,
    pub display_name: String,
    pub coins: f64,
    pub gems: i32,
    pub rank_id: String,
    pub total_playtime: i64,
    pub is_online: bool,
    /// Empty when the player has no known node.
    pub last_server: String,
}

impl From<&PlayerState> for PlayerDataResponse {
    fn from(state: &PlayerState) -> Self {
        Self {
            uuid: state.id.to_string(),
            username: state.username.clone(),
            display_name: state.display_name.clone(),
            coins: state.coins,
            gems: state.gems,
            rank_id: state.rank_id.clone(),
            total_playtime: state.total_playtime_ms,
            is_online: state.online,
            last_server: state.last_node.clone().unwrap_or_default(),
        }
    }
}

/// One row of the coin leaderboard.
#[derive(Debug, Clone, PartialEq)]
pub struct TopPlayerEntry {
    pub uuid: String,
    pub username: String,
    pub coins: f64,
    pub gems: i32,
    pub rank_id: String,
}

impl From<&PlayerState> for TopPlayerEntry {
    fn from(state: &PlayerState) -> Self {
        Self {
            uuid: state.id.to_string(),
            username: state.username.clone(),
            coins: state.coins,
            gems: state.gems,
            rank_id: state.rank_id.clone(),
        }
    }
}

/// A response sent by the hub to one node.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    PlayerData(PlayerDataResponse),
    TopPlayers(Vec<TopPlayerEntry>),
    Pong {
        sender_tag: String,
        timestamp: i64,
    },
    Status {
        store_healthy: bool,
        timestamp: i64,
        player_count: i32,
        version_tag: String,
    },
}

impl Response {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::PlayerData(_) => PLAYER_DATA_RESPONSE,
            Self::TopPlayers(_) => TOP_PLAYERS_RESPONSE,
            Self::Pong { .. } => PONG,
            Self::Status { .. } => STATUS_RESPONSE,
        }
    }

    /// The channel this response travels on.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::TopPlayers(_) => ECONOMY_CHANNEL,
            _ => CORE_CHANNEL,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = WireWriter::with_tag(self.message_type())?;
        match self {
            Self::PlayerData(data) => {
                writer.write_str(&data.uuid)?;
                writer.write_str(&data.username)?;
                writer.write_str(&data.display_name)?;
                writer.write_f64(data.coins);
                writer.write_i32(data.gems);
                writer.write_str(&data.rank_id)?;
                writer.write_i64(data.total_playtime);
                writer.write_bool(data.is_online);
                writer.write_str(&data.last_server)?;
            }
            Self::TopPlayers(entries) => {
                let count = i32::try_from(entries.len()).map_err(|_| WireError::InvalidField {
                    field: "count",
                    reason: format!("{} entries do not fit an i32", entries.len()),
                })?;
                writer.write_i32(count);
                for entry in entries {
                    writer.write_str(&entry.uuid)?;
                    writer.write_str(&entry.username)?;
                    writer.write_f64(entry.coins);
                    writer.write_i32(entry.gems);
                    writer.write_str(&entry.rank_id)?;
                }
            }
            Self::Pong {
                sender_tag,
                timestamp,
            } => {
                writer.write_str(sender_tag)?;
                writer.write_i64(*timestamp);
            }
            Self::Status {
                store_healthy,
                timestamp,
                player_count,
                version_tag,
            } => {
                writer.write_bool(*store_healthy);
                writer.write_i64(*timestamp);
                writer.write_i32(*player_count);
                writer.write_str(version_tag)?;
            }
        }
        Ok(writer.into_bytes())
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let (message_type, mut reader) = WireReader::split_tag(raw)?;
        let reader = &mut reader;

        Ok(match message_type.as_str() {
            PLAYER_DATA_RESPONSE => Self::PlayerData(PlayerDataResponse {
                uuid: reader.read_str()?,
                username: reader.read_str()?,
                display_name: reader.read_str()?,
                coins: reader.read_f64()?,
                gems: reader.read_i32()?,
                rank_id: reader.read_str()?,
                total_playtime: reader.read_i64()?,
                is_online: reader.read_bool()?,
                last_server: reader.read_str()?,
            }),
            TOP_PLAYERS_RESPONSE => {
                let count = reader.read_i32()?;
                if count < 0 {
                    return Err(WireError::InvalidField {
                        field: "count",
                        reason: format!("negative entry count {count}"),
                    });
                }
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push(TopPlayerEntry {
                        uuid: reader.read_str()?,
                        username: reader.read_str()?,
                        coins: reader.read_f64()?,
                        gems: reader.read_i32()?,
                        rank_id: reader.read_str()?,
                    });
                }
                Self::TopPlayers(entries)
            }
            PONG => Self::Pong {
                sender_tag: reader.read_str()?,
                timestamp: reader.read_i64()?,
            },
            STATUS_RESPONSE => Self::Status {
                store_healthy: reader.read_bool()?,
                timestamp: reader.read_i64()?,
                player_count: reader.read_i32()?,
                version_tag: reader.read_str()?,
            },
            other => return Err(WireError::UnknownMessageType(other.to_string())),
        })
    }
}
