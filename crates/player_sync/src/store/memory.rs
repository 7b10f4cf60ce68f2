//! In-process backing store.
//!
//! `MemoryDatabase` stands in for the relational server: tables live behind
//! a mutex and can be made unreachable or made to fail probes, which lets
//! the supervisor's repair path run without a real database.

use super::supervisor::{ConnectionSupervisor, Connector, StoreConnection};
use super::{PlayerStore, StoreStats, StoreValue};
use crate::error::StoreError;
use crate::types::{PlayerId, PlayerState, DEFAULT_RANK};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

type PluginDataKey = (String, Option<PlayerId>, String);

/// The three tables of the store, as plain collections.
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    pub players: BTreeMap<PlayerId, PlayerState>,
    pub nodes: BTreeSet<String>,
    pub plugin_data: BTreeMap<PluginDataKey, StoreValue>,
}

/// A shared in-memory database with fault injection.
#[derive(Debug)]
pub struct MemoryDatabase {
    tables: Mutex<MemoryTables>,
    auto_commit: AtomicBool,
    reachable: AtomicBool,
    probe_failures: AtomicU32,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(MemoryTables::default()),
            auto_commit: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            probe_failures: AtomicU32::new(0),
        }
    }

    /// While unreachable, probes, connects and statements all fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Makes the next `count` liveness probes fail.
    pub fn fail_next_probes(&self, count: u32) {
        self.probe_failures.store(count, Ordering::SeqCst);
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::SeqCst)
    }

    /// Copy of every table.
    pub fn snapshot(&self) -> MemoryTables {
        self.tables().clone()
    }

    pub fn register_node(&self, name: &str) {
        self.tables().nodes.insert(name.to_string());
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn tables(&self) -> MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One session against a [`MemoryDatabase`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    database: Arc<MemoryDatabase>,
    open: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn check(&self) -> Result<(), StoreError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(StoreError::NoActiveConnection);
        }
        if !self.database.is_reachable() {
            return Err(StoreError::Query("memory database is unreachable".to_string()));
        }
        Ok(())
    }

    fn with_tables<T>(&self, work: impl FnOnce(&mut MemoryTables) -> T) -> Result<T, StoreError> {
        self.check()?;
        Ok(work(&mut self.database.tables()))
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()?;
        let failures = &self.database.probe_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Query("injected probe failure".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Opens connections to a shared [`MemoryDatabase`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    database: Arc<MemoryDatabase>,
}

impl MemoryConnector {
    pub fn new(database: Arc<MemoryDatabase>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn describe(&self) -> String {
        "memory://local".to_string()
    }

    async fn connect(&self) -> Result<MemoryConnection, StoreError> {
        if !self.database.is_reachable() {
            return Err(StoreError::Connect("memory database is unreachable".to_string()));
        }
        Ok(MemoryConnection {
            database: self.database.clone(),
            open: Arc::new(AtomicBool::new(true)),
        })
    }
}

/// Restores the auto-commit flag when a transaction ends, even by panic.
struct AutoCommitGuard<'a> {
    database: &'a MemoryDatabase,
    previous: bool,
}

impl Drop for AutoCommitGuard<'_> {
    fn drop(&mut self) {
        self.database.auto_commit.store(self.previous, Ordering::SeqCst);
    }
}

/// [`PlayerStore`] over a [`MemoryDatabase`], with the same row semantics as
/// the SQL store.
pub struct MemoryPlayerStore {
    supervisor: Arc<ConnectionSupervisor<MemoryConnector>>,
}

impl MemoryPlayerStore {
    pub fn new(supervisor: Arc<ConnectionSupervisor<MemoryConnector>>) -> Self {
        Self { supervisor }
    }

    async fn with_tables<T>(
        &self,
        work: impl FnOnce(&mut MemoryTables) -> T + Send,
    ) -> Result<T, StoreError> {
        let connection = self.supervisor.acquire().await?;
        connection.with_tables(work)
    }

    /// Runs `work` against a staged copy of the tables. The copy replaces
    /// the tables only if `work` succeeds; on error nothing is applied and
    /// the error is returned unchanged.
    pub async fn run_transaction<T>(
        &self,
        work: impl FnOnce(&mut MemoryTables) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let connection = self.supervisor.acquire().await?;
        connection.check()?;
        let database = connection.database.as_ref();

        let _auto_commit = AutoCommitGuard {
            database,
            previous: database.auto_commit.swap(false, Ordering::SeqCst),
        };

        let mut tables = database.tables();
        let mut staged = tables.clone();
        match work(&mut staged) {
            Ok(value) => {
                *tables = staged;
                debug!("Memory transaction committed");
                Ok(value)
            }
            Err(e) => {
                warn!("Memory transaction rolled back: {}", e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PlayerStore for MemoryPlayerStore {
    async fn load_by_id(&self, id: PlayerId) -> Result<Option<PlayerState>, StoreError> {
        self.with_tables(|t| t.players.get(&id).cloned()).await
    }

    async fn load_by_name(&self, name: &str) -> Result<Option<PlayerState>, StoreError> {
        let wanted = name.to_lowercase();
        self.with_tables(|t| {
            t.players
                .values()
                .find(|p| p.username.to_lowercase() == wanted)
                .cloned()
        })
        .await
    }

    async fn upsert_on_session_start(&self, state: &PlayerState) -> Result<(), StoreError> {
        self.with_tables(|t| match t.players.get_mut(&state.id) {
            Some(row) => {
                row.username = state.username.clone();
                row.display_name = state.display_name.clone();
                row.last_seen = state.last_seen;
                row.online = true;
            }
            None => {
                t.players.insert(
                    state.id,
                    PlayerState {
                        id: state.id,
                        username: state.username.clone(),
                        display_name: state.display_name.clone(),
                        first_seen: state.first_seen,
                        last_seen: state.last_seen,
                        last_node: None,
                        total_playtime_ms: 0,
                        coins: 0.0,
                        gems: 0,
                        rank_id: DEFAULT_RANK.to_string(),
                        permissions: None,
                        extra_data: None,
                        online: true,
                    },
                );
            }
        })
        .await
    }

    async fn set_online_status(
        &self,
        id: PlayerId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_tables(|t| {
            if let Some(row) = t.players.get_mut(&id) {
                row.online = online;
                row.last_seen = at;
            }
        })
        .await
    }

    async fn set_last_node(&self, id: PlayerId, node: &str) -> Result<(), StoreError> {
        self.with_tables(|t| {
            if let Some(row) = t.players.get_mut(&id) {
                row.last_node = Some(node.to_string());
            }
        })
        .await
    }

    async fn set_coins(&self, id: PlayerId, coins: f64) -> Result<(), StoreError> {
        self.with_tables(|t| {
            if let Some(row) = t.players.get_mut(&id) {
                row.coins = coins;
            }
        })
        .await
    }

    async fn set_gems(&self, id: PlayerId, gems: i32) -> Result<(), StoreError> {
        self.with_tables(|t| {
            if let Some(row) = t.players.get_mut(&id) {
                row.gems = gems;
            }
        })
        .await
    }

    async fn set_rank(&self, id: PlayerId, rank_id: &str) -> Result<(), StoreError> {
        self.with_tables(|t| {
            if let Some(row) = t.players.get_mut(&id) {
                row.rank_id = rank_id.to_string();
            }
        })
        .await
    }

    async fn save_full(&self, state: &PlayerState) -> Result<(), StoreError> {
        self.with_tables(|t| {
            if let Some(row) = t.players.get_mut(&state.id) {
                row.coins = state.coins;
                row.gems = state.gems;
                row.rank_id = state.rank_id.clone();
                row.permissions = state.permissions.clone();
                row.extra_data = state.extra_data.clone();
                row.total_playtime_ms = state.total_playtime_ms;
                row.last_node = state.last_node.clone();
            }
        })
        .await
    }

    async fn top_by_coins(&self, limit: i32) -> Result<Vec<PlayerState>, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        self.with_tables(|t| {
            let mut ranked: Vec<PlayerState> = t.players.values().cloned().collect();
            ranked.sort_by(|a, b| {
                b.coins
                    .partial_cmp(&a.coins)
                    .unwrap_or(CmpOrdering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            ranked.truncate(limit);
            ranked
        })
        .await
    }

    async fn get_plugin_data(
        &self,
        plugin: &str,
        player: Option<PlayerId>,
        key: &str,
    ) -> Result<Option<StoreValue>, StoreError> {
        let entry = (plugin.to_string(), player, key.to_string());
        self.with_tables(|t| t.plugin_data.get(&entry).cloned()).await
    }

    async fn set_plugin_data(
        &self,
        plugin: &str,
        player: Option<PlayerId>,
        key: &str,
        value: &StoreValue,
    ) -> Result<(), StoreError> {
        let entry = (plugin.to_string(), player, key.to_string());
        let value = value.clone();
        self.with_tables(|t| {
            t.plugin_data.insert(entry, value);
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.with_tables(|t| StoreStats {
            total_players: t.players.len() as i64,
            online_players: t.players.values().filter(|p| p.online).count() as i64,
            total_nodes: t.nodes.len() as i64,
            plugin_data_entries: t.plugin_data.len() as i64,
        })
        .await
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.with_tables(|_| ()).await
    }

    async fn is_healthy(&self) -> bool {
        self.supervisor.is_healthy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConnectionState, SupervisorConfig};
    use crate::types::now_seconds;

    async fn open_store() -> (Arc<MemoryDatabase>, MemoryPlayerStore) {
        let database = Arc::new(MemoryDatabase::new());
        let supervisor = ConnectionSupervisor::connect(
            MemoryConnector::new(database.clone()),
            SupervisorConfig::default(),
        )
        .await
        .unwrap();
        (database, MemoryPlayerStore::new(supervisor))
    }

    fn player_with_coins(coins: f64) -> PlayerState {
        let mut state = PlayerState::bootstrap(PlayerId::new(), "p", now_seconds());
        state.coins = coins;
        state
    }

    #[tokio::test]
    async fn test_save_full_then_load_round_trips() {
        let (_database, store) = open_store().await;
        let mut state = PlayerState::bootstrap(PlayerId::new(), "Jeb", now_seconds());
        store.upsert_on_session_start(&state).await.unwrap();

        state.coins = 812.25;
        state.gems = 14;
        state.rank_id = "mvp".to_string();
        state.permissions = Some("fly,kit.vip".to_string());
        state.extra_data = Some("{\"pet\":\"wolf\"}".to_string());
        state.total_playtime_ms = 90_000;
        state.last_node = Some("skyblock".to_string());
        store.save_full(&state).await.unwrap();

        assert_eq!(store.load_by_id(state.id).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_repeated_upsert_keeps_balances_and_rank() {
        let (_database, store) = open_store().await;
        let id = PlayerId::new();
        let first = PlayerState::bootstrap(id, "Dinnerbone", now_seconds());
        store.upsert_on_session_start(&first).await.unwrap();
        store.set_coins(id, 55.0).await.unwrap();
        store.set_gems(id, 3).await.unwrap();
        store.set_rank(id, "builder").await.unwrap();

        let mut again = first.clone();
        again.username = "dinnerbone".to_string();
        again.coins = 0.0;
        again.rank_id = DEFAULT_RANK.to_string();
        store.upsert_on_session_start(&again).await.unwrap();
        store.upsert_on_session_start(&again).await.unwrap();

        let row = store.load_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.coins, 55.0);
        assert_eq!(row.gems, 3);
        assert_eq!(row.rank_id, "builder");
        assert_eq!(row.username, "dinnerbone");
        assert!(row.online);
    }

    #[tokio::test]
    async fn test_load_by_name_ignores_case() {
        let (_database, store) = open_store().await;
        let state = PlayerState::bootstrap(PlayerId::new(), "CaptainSparklez", now_seconds());
        store.upsert_on_session_start(&state).await.unwrap();

        let found = store.load_by_name("captainsparklez").await.unwrap().unwrap();
        assert_eq!(found.id, state.id);
        assert!(store.load_by_name("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_top_by_coins_breaks_ties_by_identifier() {
        let (database, store) = open_store().await;
        {
            let mut tables = database.tables();
            for coins in [10.0, 50.0, 50.0, 5.0] {
                let state = player_with_coins(coins);
                tables.players.insert(state.id, state);
            }
        }

        let top = store.top_by_coins(2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert!(top.iter().all(|p| p.coins == 50.0));
        assert!(top[0].id < top[1].id);

        assert!(store.top_by_coins(0).await.unwrap().is_empty());
        assert!(store.top_by_coins(-3).await.unwrap().is_empty());
        assert_eq!(store.top_by_coins(10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_transaction_commits_or_rolls_back() {
        let (database, store) = open_store().await;
        let state = player_with_coins(20.0);
        store.upsert_on_session_start(&state).await.unwrap();
        store.set_coins(state.id, 20.0).await.unwrap();

        let observed = database.clone();
        let result: Result<(), StoreError> = store
            .run_transaction(move |t| {
                assert!(!observed.auto_commit());
                if let Some(row) = t.players.get_mut(&state.id) {
                    row.coins = 0.0;
                }
                Err(StoreError::Query("constraint violated".to_string()))
            })
            .await;

        assert_eq!(result, Err(StoreError::Query("constraint violated".to_string())));
        assert!(database.auto_commit());
        assert_eq!(store.load_by_id(state.id).await.unwrap().unwrap().coins, 20.0);

        let moved = store
            .run_transaction(|t| {
                let row = t
                    .players
                    .get_mut(&state.id)
                    .ok_or_else(|| StoreError::Query("missing row".to_string()))?;
                row.coins -= 5.0;
                Ok(row.coins)
            })
            .await
            .unwrap();

        assert_eq!(moved, 15.0);
        assert!(database.auto_commit());
        assert_eq!(store.load_by_id(state.id).await.unwrap().unwrap().coins, 15.0);
    }

    #[tokio::test]
    async fn test_plugin_data_and_stats() {
        let (database, store) = open_store().await;
        let state = PlayerState::bootstrap(PlayerId::new(), "Grian", now_seconds());
        store.upsert_on_session_start(&state).await.unwrap();
        database.register_node("lobby");

        store
            .set_plugin_data("quests", Some(state.id), "done", &StoreValue::Int(3))
            .await
            .unwrap();
        store
            .set_plugin_data("quests", Some(state.id), "done", &StoreValue::Int(4))
            .await
            .unwrap();
        store
            .set_plugin_data("quests", None, "season", &StoreValue::from("spring"))
            .await
            .unwrap();

        assert_eq!(
            store.get_plugin_data("quests", Some(state.id), "done").await.unwrap(),
            Some(StoreValue::Int(4))
        );
        assert_eq!(store.get_plugin_data("quests", None, "missing").await.unwrap(), None);

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            StoreStats {
                total_players: 1,
                online_players: 1,
                total_nodes: 1,
                plugin_data_entries: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_operations_fail_fast_while_degraded() {
        let database = Arc::new(MemoryDatabase::new());
        let supervisor = ConnectionSupervisor::connect(
            MemoryConnector::new(database.clone()),
            SupervisorConfig::default(),
        )
        .await
        .unwrap();
        let store = MemoryPlayerStore::new(supervisor.clone());

        database.set_reachable(false);
        assert_eq!(supervisor.run_health_check().await, ConnectionState::Degraded);
        assert_eq!(
            store.load_by_id(PlayerId::new()).await.unwrap_err(),
            StoreError::NoActiveConnection
        );
        assert!(!store.is_healthy().await);

        database.set_reachable(true);
        assert_eq!(supervisor.run_health_check().await, ConnectionState::Connected);
        assert_eq!(store.load_by_id(PlayerId::new()).await.unwrap(), None);
    }
}
