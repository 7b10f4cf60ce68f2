//! The in-memory cache of online players.
//!
//! While a player is online the cached copy is authoritative: reads never
//! touch the store and mutations update the cache before issuing a narrow
//! store write. Offline players are read through to the store without
//! being cached.

use crate::error::StoreError;
use crate::store::PlayerStore;
use crate::types::{now_seconds, BalanceChange, PlayerId, PlayerState};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of [`PlayerCache::flush_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub saved: usize,
    pub failed: usize,
}

/// Aggregates over the cached (online) players.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub online_players: usize,
    pub total_coins: f64,
    pub total_gems: i64,
}

/// Concurrent map from player ID to the player's live state.
///
/// Concurrent writers to the same player follow last-write-wins; there is
/// no per-player lock.
pub struct PlayerCache {
    store: Arc<dyn PlayerStore>,
    players: DashMap<PlayerId, PlayerState>,
}

impl PlayerCache {
    pub fn new(store: Arc<dyn PlayerStore>) -> Self {
        Self {
            store,
            players: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PlayerStore> {
        &self.store
    }

    /// The cached copy, or the persisted one if the player is not cached.
    /// A store hit is not inserted into the cache.
    pub async fn get(&self, id: PlayerId) -> Result<Option<PlayerState>, StoreError> {
        let cached = self.players.get(&id).map(|entry| entry.value().clone());
        match cached {
            Some(state) => Ok(Some(state)),
            None => self.store.load_by_id(id).await,
        }
    }

    /// Case-insensitive name lookup over the cache, then the store.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<PlayerState>, StoreError> {
        let wanted = name.to_lowercase();
        let cached = self
            .players
            .iter()
            .find(|entry| entry.username.to_lowercase() == wanted)
            .map(|entry| entry.value().clone());
        match cached {
            Some(state) => Ok(Some(state)),
            None => self.store.load_by_name(name).await,
        }
    }

    /// Loads or bootstraps the player, records the session start in the
    /// store and caches the result. A player already cached is replaced.
    pub async fn on_session_start(&self, id: PlayerId, name: &str) -> Result<PlayerState, StoreError> {
        let now = now_seconds();

        let state = match self.store.load_by_id(id).await? {
            Some(mut existing) => {
                existing.username = name.to_string();
                existing.display_name = name.to_string();
                existing.last_seen = now;
                existing.online = true;
                existing
            }
            None => {
                info!("🆕 First session for player {} ({})", name, id);
                PlayerState::bootstrap(id, name, now)
            }
        };

        self.store.upsert_on_session_start(&state).await?;

        if self.players.insert(id, state.clone()).is_some() {
            warn!("⚠️ Duplicate session start for {} ({}), replacing cached state", name, id);
        }

        info!("👋 Session started for {} ({})", name, id);
        Ok(state)
    }

    /// Flushes and evicts the player.
    ///
    /// The session's duration is added to the playtime, the state is saved,
    /// the online flag cleared, and the entry evicted, in that order. The
    /// entry is evicted even when a store write fails; the first failure is
    /// returned.
    pub async fn on_session_end(&self, id: PlayerId) -> Result<(), StoreError> {
        let now = now_seconds();
        let mut first_error = None;

        let cached = self.players.get(&id).map(|entry| entry.value().clone());
        if let Some(mut state) = cached {
            let session_ms = (now - state.last_seen).num_milliseconds();
            state.add_playtime(session_ms);
            state.online = false;

            if let Err(e) = self.store.save_full(&state).await {
                error!("❌ Failed to save {} on session end: {}", id, e);
                first_error = Some(e);
            }
        } else {
            debug!("Session end for uncached player {}", id);
        }

        if let Err(e) = self.store.set_online_status(id, false, now).await {
            error!("❌ Failed to mark {} offline: {}", id, e);
            if first_error.is_none() {
                first_error = Some(e);
            }
        }

        self.players.remove(&id);
        info!("👋 Session ended for {}", id);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ends the session of every cached player last seen on `node`.
    ///
    /// # Returns
    ///
    /// The number of sessions ended. Store failures are logged; the players
    /// are evicted regardless.
    pub async fn end_sessions_on_node(&self, node: &str) -> usize {
        let stranded: Vec<PlayerId> = self
            .players
            .iter()
            .filter(|entry| entry.last_node.as_deref() == Some(node))
            .map(|entry| *entry.key())
            .collect();

        for id in &stranded {
            if let Err(e) = self.on_session_end(*id).await {
                warn!("Session of {} on lost node {} ended with error: {}", id, node, e);
            }
        }

        if !stranded.is_empty() {
            info!("🧹 Ended {} session(s) left open by node {}", stranded.len(), node);
        }
        stranded.len()
    }

    /// Records the node a player moved to.
    pub async fn on_node_switch(&self, id: PlayerId, node: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.players.get_mut(&id) {
            entry.last_node = Some(node.to_string());
        }
        self.store.set_last_node(id, node).await?;
        debug!("🔀 Player {} moved to node {}", id, node);
        Ok(())
    }

    /// Applies a coin change and persists the new balance.
    ///
    /// Returns the new balance, or `None` when the player exists neither in
    /// the cache nor in the store. Nothing is written in that case.
    pub async fn update_coins(
        &self,
        id: PlayerId,
        change: BalanceChange<f64>,
    ) -> Result<Option<f64>, StoreError> {
        let cached = self.players.get_mut(&id).map(|mut entry| {
            entry.coins = change.apply(entry.coins);
            entry.coins
        });

        let coins = match (cached, change) {
            (Some(coins), _) => coins,
            (None, change) => match self.store.load_by_id(id).await? {
                Some(state) => change.apply(state.coins),
                None => return Ok(None),
            },
        };

        self.store.set_coins(id, coins).await?;
        debug!("💰 Coins of {} set to {}", id, coins);
        Ok(Some(coins))
    }

    /// Applies a gem change and persists the new balance. See
    /// [`update_coins`](Self::update_coins).
    pub async fn update_gems(
        &self,
        id: PlayerId,
        change: BalanceChange<i32>,
    ) -> Result<Option<i32>, StoreError> {
        let cached = self.players.get_mut(&id).map(|mut entry| {
            entry.gems = change.apply(entry.gems);
            entry.gems
        });

        let gems = match (cached, change) {
            (Some(gems), _) => gems,
            (None, change) => match self.store.load_by_id(id).await? {
                Some(state) => change.apply(state.gems),
                None => return Ok(None),
            },
        };

        self.store.set_gems(id, gems).await?;
        debug!("💎 Gems of {} set to {}", id, gems);
        Ok(Some(gems))
    }

    pub async fn update_rank(&self, id: PlayerId, rank_id: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.players.get_mut(&id) {
            entry.rank_id = rank_id.to_string();
        }
        self.store.set_rank(id, rank_id).await?;
        debug!("🏅 Rank of {} set to {}", id, rank_id);
        Ok(())
    }

    /// Leaderboard straight from the store.
    pub async fn top_by_coins(&self, limit: i32) -> Result<Vec<PlayerState>, StoreError> {
        self.store.top_by_coins(limit).await
    }

    /// Saves every cached player without evicting anyone.
    pub async fn flush_all(&self) -> FlushReport {
        let snapshot: Vec<PlayerState> = self
            .players
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut report = FlushReport::default();
        for state in &snapshot {
            match self.store.save_full(state).await {
                Ok(()) => report.saved += 1,
                Err(e) => {
                    warn!("Failed to save {} during flush: {}", state.id, e);
                    report.failed += 1;
                }
            }
        }

        if report.failed > 0 {
            warn!("💾 Flushed {} player(s), {} failed", report.saved, report.failed);
        } else {
            debug!("💾 Flushed {} player(s)", report.saved);
        }
        report
    }

    pub fn stats(&self) -> CacheStats {
        self.players
            .iter()
            .fold(CacheStats::default(), |mut stats, entry| {
                stats.online_players += 1;
                stats.total_coins += entry.coins;
                stats.total_gems += i64::from(entry.gems);
                stats
            })
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn contains(&self, id: PlayerId) -> bool {
        self.players.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConnectionSupervisor, MemoryConnector, MemoryDatabase, MemoryPlayerStore, SupervisorConfig};
    use chrono::Duration;

    struct Fixture {
        database: Arc<MemoryDatabase>,
        supervisor: Arc<ConnectionSupervisor<MemoryConnector>>,
        store: Arc<dyn PlayerStore>,
        cache: PlayerCache,
    }

    async fn fixture() -> Fixture {
        let database = Arc::new(MemoryDatabase::new());
        let supervisor = ConnectionSupervisor::connect(
            MemoryConnector::new(database.clone()),
            SupervisorConfig::default(),
        )
        .await
        .unwrap();
        let store: Arc<dyn PlayerStore> = Arc::new(MemoryPlayerStore::new(supervisor.clone()));
        let cache = PlayerCache::new(store.clone());
        Fixture {
            database,
            supervisor,
            store,
            cache,
        }
    }

    #[tokio::test]
    async fn test_session_start_matches_store() {
        let f = fixture().await;
        let id = PlayerId::new();

        let started = f.cache.on_session_start(id, "Technoblade").await.unwrap();

        let cached = f.cache.get(id).await.unwrap();
        let stored = f.store.load_by_id(id).await.unwrap();
        assert_eq!(cached, stored);
        assert_eq!(cached, Some(started));
        assert!(f.cache.contains(id));
    }

    #[tokio::test]
    async fn test_session_start_keeps_existing_balances() {
        let f = fixture().await;
        let id = PlayerId::new();
        f.cache.on_session_start(id, "Ph1LzA").await.unwrap();
        f.cache.update_coins(id, BalanceChange::Set(250.0)).await.unwrap();
        f.cache.on_session_end(id).await.unwrap();

        let again = f.cache.on_session_start(id, "Philza").await.unwrap();
        assert_eq!(again.coins, 250.0);
        assert_eq!(again.username, "Philza");
        assert!(again.online);
    }

    #[tokio::test]
    async fn test_session_end_flushes_and_evicts() {
        let f = fixture().await;
        let id = PlayerId::new();
        f.cache.on_session_start(id, "Tommy").await.unwrap();

        // Pretend the session began ten minutes ago.
        if let Some(mut entry) = f.cache.players.get_mut(&id) {
            entry.last_seen = entry.last_seen - Duration::minutes(10);
            entry.gems = 9;
        }

        f.cache.on_session_end(id).await.unwrap();

        assert!(!f.cache.contains(id));
        let stored = f.cache.get(id).await.unwrap().unwrap();
        assert!(!stored.online);
        assert_eq!(stored.gems, 9);
        assert!(stored.total_playtime_ms >= 600_000);
    }

    #[tokio::test]
    async fn test_session_end_evicts_even_when_save_fails() {
        let f = fixture().await;
        let id = PlayerId::new();
        f.cache.on_session_start(id, "Wilbur").await.unwrap();

        f.database.set_reachable(false);
        f.supervisor.run_health_check().await;

        let result = f.cache.on_session_end(id).await;
        assert_eq!(result, Err(StoreError::NoActiveConnection));
        assert!(!f.cache.contains(id));

        f.database.set_reachable(true);
        f.supervisor.run_health_check().await;
        let stored = f.cache.get(id).await.unwrap().unwrap();
        assert!(stored.online, "store row was never updated");
    }

    #[tokio::test]
    async fn test_offline_reads_do_not_populate() {
        let f = fixture().await;
        let id = PlayerId::new();
        f.cache.on_session_start(id, "Niki").await.unwrap();
        f.cache.on_session_end(id).await.unwrap();

        assert!(f.cache.get(id).await.unwrap().is_some());
        assert!(f.cache.get_by_name("NIKI").await.unwrap().is_some());
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn test_balance_updates_online_and_offline() {
        let f = fixture().await;
        let online = PlayerId::new();
        let offline = PlayerId::new();
        f.cache.on_session_start(online, "Online").await.unwrap();
        f.cache.on_session_start(offline, "Offline").await.unwrap();
        f.cache.update_gems(offline, BalanceChange::Set(5)).await.unwrap();
        f.cache.on_session_end(offline).await.unwrap();

        assert_eq!(
            f.cache.update_coins(online, BalanceChange::Add(12.5)).await.unwrap(),
            Some(12.5)
        );
        assert_eq!(
            f.cache.update_gems(offline, BalanceChange::Add(3)).await.unwrap(),
            Some(8)
        );
        assert_eq!(
            f.cache
                .update_coins(PlayerId::new(), BalanceChange::Add(1.0))
                .await
                .unwrap(),
            None
        );

        assert_eq!(f.store.load_by_id(online).await.unwrap().unwrap().coins, 12.5);
        assert_eq!(f.store.load_by_id(offline).await.unwrap().unwrap().gems, 8);
    }

    #[tokio::test]
    async fn test_set_on_unknown_player_changes_nothing() {
        let f = fixture().await;
        let ghost = PlayerId::new();

        assert_eq!(f.cache.update_coins(ghost, BalanceChange::Set(5.0)).await.unwrap(), None);
        assert_eq!(f.cache.update_gems(ghost, BalanceChange::Set(7)).await.unwrap(), None);
        assert!(f.store.load_by_id(ghost).await.unwrap().is_none());
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_cached_value() {
        let f = fixture().await;
        let id = PlayerId::new();
        f.cache.on_session_start(id, "Ranboo").await.unwrap();

        f.database.set_reachable(false);
        f.supervisor.run_health_check().await;

        let result = f.cache.update_coins(id, BalanceChange::Set(42.0)).await;
        assert_eq!(result, Err(StoreError::NoActiveConnection));
        assert_eq!(f.cache.get(id).await.unwrap().unwrap().coins, 42.0);
    }

    #[tokio::test]
    async fn test_rank_and_node_switch() {
        let f = fixture().await;
        let id = PlayerId::new();
        f.cache.on_session_start(id, "Sapnap").await.unwrap();

        f.cache.update_rank(id, "vip").await.unwrap();
        f.cache.on_node_switch(id, "bedwars-3").await.unwrap();

        let cached = f.cache.get(id).await.unwrap().unwrap();
        assert_eq!(cached.rank_id, "vip");
        assert_eq!(cached.last_node.as_deref(), Some("bedwars-3"));

        let stored = f.store.load_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.rank_id, "vip");
        assert_eq!(stored.last_node.as_deref(), Some("bedwars-3"));
    }

    #[tokio::test]
    async fn test_end_sessions_on_node_only_touches_that_node() {
        let f = fixture().await;
        let stranded = PlayerId::new();
        let elsewhere = PlayerId::new();
        f.cache.on_session_start(stranded, "Bad").await.unwrap();
        f.cache.on_node_switch(stranded, "skyblock").await.unwrap();
        f.cache.on_session_start(elsewhere, "Foolish").await.unwrap();
        f.cache.on_node_switch(elsewhere, "lobby").await.unwrap();

        assert_eq!(f.cache.end_sessions_on_node("skyblock").await, 1);

        assert!(!f.cache.contains(stranded));
        assert!(!f.store.load_by_id(stranded).await.unwrap().unwrap().online);
        assert!(f.cache.contains(elsewhere));
        assert_eq!(f.cache.end_sessions_on_node("skyblock").await, 0);
    }

    #[tokio::test]
    async fn test_flush_all_reports_and_keeps_entries() {
        let f = fixture().await;
        for name in ["a", "b", "c"] {
            let id = PlayerId::new();
            f.cache.on_session_start(id, name).await.unwrap();
            f.cache.update_coins(id, BalanceChange::Set(10.0)).await.unwrap();
        }

        let report = f.cache.flush_all().await;
        assert_eq!(report, FlushReport { saved: 3, failed: 0 });
        assert_eq!(f.cache.len(), 3);

        let stats = f.cache.stats();
        assert_eq!(stats.online_players, 3);
        assert_eq!(stats.total_coins, 30.0);
        assert_eq!(stats.total_gems, 0);

        f.database.set_reachable(false);
        f.supervisor.run_health_check().await;
        assert_eq!(f.cache.flush_all().await, FlushReport { saved: 0, failed: 3 });
    }
}
