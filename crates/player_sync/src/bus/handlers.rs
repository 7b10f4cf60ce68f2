//! Handlers that answer node requests from the player cache.

use super::{ChannelRegistry, InboundMessage, MessageBus, CORE_CHANNEL};
use crate::cache::PlayerCache;
use crate::error::BusError;
use crate::protocol::{self, PlayerDataResponse, Request, Response, TopPlayerEntry};
use crate::types::{BalanceChange, PlayerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Settings for the built-in request handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSettings {
    /// Sender tag carried by PONG.
    pub hub_tag: String,
    /// Version string carried by STATUS_RESPONSE.
    pub version_tag: String,
    /// Broadcast PLAYER_UPDATE after successful balance and rank changes.
    pub broadcast_updates: bool,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            hub_tag: "hub".to_string(),
            version_tag: env!("CARGO_PKG_VERSION").to_string(),
            broadcast_updates: true,
        }
    }
}

struct HandlerContext {
    cache: Arc<PlayerCache>,
    settings: HandlerSettings,
}

/// Registers a handler for every message type the default channels accept,
/// plus a disconnect callback that ends the sessions a lost node left open.
///
/// Economy requests are reachable both on the core and on the economy
/// channel, so they are registered under both families.
pub async fn register_player_handlers(
    bus: &MessageBus,
    cache: Arc<PlayerCache>,
    settings: HandlerSettings,
) -> Result<(), BusError> {
    // Both tags travel as wire strings; reject ones that cannot.
    Response::Pong {
        sender_tag: settings.hub_tag.clone(),
        timestamp: 0,
    }
    .encode()?;
    Response::Status {
        store_healthy: true,
        timestamp: 0,
        player_count: 0,
        version_tag: settings.version_tag.clone(),
    }
    .encode()?;

    let context = Arc::new(HandlerContext { cache, settings });

    let mut count = 0;
    for (_, family, accepted) in ChannelRegistry::default_channels() {
        for message_type in accepted {
            let context = context.clone();
            bus.on(family, message_type, move |message| {
                handle_request(context.clone(), message)
            })
            .await;
            count += 1;
        }
    }

    let cache = context.cache.clone();
    bus.on_disconnect(move |node: String| {
        let cache = cache.clone();
        async move {
            cache.end_sessions_on_node(&node).await;
        }
    })
    .await;

    info!("✅ Registered {} player request handlers", count);
    Ok(())
}

async fn handle_request(
    context: Arc<HandlerContext>,
    mut message: InboundMessage,
) -> Result<(), BusError> {
    let request = Request::decode_fields(&message.message_type, &mut message.reader)?;
    let cache = &context.cache;

    match request {
        Request::GetPlayerData { player } | Request::SyncPlayerData { player } => {
            match cache.get(player).await? {
                Some(state) => {
                    let response = Response::PlayerData(PlayerDataResponse::from(&state));
                    message.respond(&response).await?;
                }
                None => warn!(
                    "⚠️ Node {} asked for unknown player {}",
                    message.source_node, player
                ),
            }
        }
        Request::UpdateCoins { player, coins } => {
            match cache.update_coins(player, BalanceChange::Set(coins)).await? {
                Some(_) => context.announce(&message, player, "coins").await,
                None => warn!(
                    "⚠️ Node {} set coins of unknown player {}",
                    message.source_node, player
                ),
            }
        }
        Request::UpdateGems { player, gems } => {
            match cache.update_gems(player, BalanceChange::Set(gems)).await? {
                Some(_) => context.announce(&message, player, "gems").await,
                None => warn!(
                    "⚠️ Node {} set gems of unknown player {}",
                    message.source_node, player
                ),
            }
        }
        Request::GetTopPlayers { limit } => {
            let top = cache.top_by_coins(limit).await?;
            let entries = top.iter().map(TopPlayerEntry::from).collect();
            message.respond(&Response::TopPlayers(entries)).await?;
        }
        Request::UpdateRank { player, rank_id } => {
            cache.update_rank(player, &rank_id).await?;
            context.announce(&message, player, "rank").await;
        }
        Request::Ping { timestamp } => {
            let response = Response::Pong {
                sender_tag: context.settings.hub_tag.clone(),
                timestamp,
            };
            message.respond(&response).await?;
        }
        Request::StatusRequest { timestamp } => {
            let response = Response::Status {
                store_healthy: cache.store().is_healthy().await,
                timestamp,
                player_count: i32::try_from(cache.len()).unwrap_or(i32::MAX),
                version_tag: context.settings.version_tag.clone(),
            };
            message.respond(&response).await?;
        }
        Request::SessionStart { player, username } => {
            cache.on_session_start(player, &username).await?;
            cache.on_node_switch(player, &message.source_node).await?;
        }
        Request::SessionEnd { player } => {
            cache.on_session_end(player).await?;
        }
        Request::NodeSwitch { player, node } => {
            cache.on_node_switch(player, &node).await?;
        }
    }

    Ok(())
}

impl HandlerContext {
    async fn announce(&self, origin: &InboundMessage, player: PlayerId, kind: &str) {
        if !self.settings.broadcast_updates {
            return;
        }
        match protocol::player_update(player, kind).encode() {
            Ok(payload) => {
                let report = origin.outbound.broadcast(CORE_CHANNEL, payload).await;
                debug!(
                    "📡 {} update for {} reached {} node(s)",
                    kind, player, report.delivered
                );
            }
            Err(e) => warn!("⚠️ Could not encode {} update for {}: {}", kind, player, e),
        }
    }
}
