//! MySQL backing store on top of `sqlx`.

use super::supervisor::{ConnectionSupervisor, Connector, StoreConnection};
use super::{PlayerStore, StoreStats, StoreValue};
use crate::error::StoreError;
use crate::types::{PlayerId, PlayerState, DEFAULT_RANK};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const PLAYER_COLUMNS: &str = "uuid, username, display_name, first_join, last_join, last_server, \
     total_playtime, coins, gems, rank_id, permissions, data, is_online";

const CREATE_PLAYERS_TABLE: &str = "CREATE TABLE IF NOT EXISTS grivyzom_players (
    uuid VARCHAR(36) NOT NULL PRIMARY KEY,
    username VARCHAR(16) NOT NULL,
    display_name VARCHAR(64) NULL,
    first_join TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    last_join TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    last_server VARCHAR(64) NULL,
    total_playtime BIGINT NOT NULL DEFAULT 0,
    coins DOUBLE NOT NULL DEFAULT 0,
    gems INT NOT NULL DEFAULT 0,
    rank_id VARCHAR(32) NOT NULL DEFAULT 'default',
    permissions TEXT NULL,
    data LONGTEXT NULL,
    is_online BOOLEAN NOT NULL DEFAULT FALSE,
    INDEX idx_username (username),
    INDEX idx_coins (coins)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

const CREATE_NODES_TABLE: &str = "CREATE TABLE IF NOT EXISTS grivyzom_servers (
    server_id VARCHAR(64) NOT NULL PRIMARY KEY,
    server_name VARCHAR(128) NOT NULL,
    server_type VARCHAR(32) NOT NULL DEFAULT 'game',
    max_players INT NOT NULL DEFAULT 100,
    is_online BOOLEAN NOT NULL DEFAULT FALSE,
    last_ping TIMESTAMP NULL
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

const CREATE_PLUGIN_DATA_TABLE: &str = "CREATE TABLE IF NOT EXISTS grivyzom_plugin_data (
    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    plugin_name VARCHAR(64) NOT NULL,
    player_uuid VARCHAR(36) NULL,
    data_key VARCHAR(128) NOT NULL,
    data_value LONGTEXT NULL,
    data_type ENUM('STRING', 'INT', 'LONG', 'DOUBLE', 'BOOLEAN', 'JSON') NOT NULL DEFAULT 'STRING',
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    UNIQUE KEY uk_plugin_player_key (plugin_name, player_uuid, data_key)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

const UPSERT_SESSION_START: &str = "INSERT INTO grivyzom_players \
     (uuid, username, display_name, first_join, last_join, is_online) \
     VALUES (?, ?, ?, ?, ?, TRUE) \
     ON DUPLICATE KEY UPDATE username = VALUES(username), display_name = VALUES(display_name), \
     last_join = VALUES(last_join), is_online = TRUE";

const SAVE_FULL: &str = "UPDATE grivyzom_players SET coins = ?, gems = ?, rank_id = ?, \
     permissions = ?, data = ?, total_playtime = ?, last_server = ? WHERE uuid = ?";

// `<=>` matches NULL player ids for plugin-global keys.
const DELETE_PLUGIN_DATA: &str = "DELETE FROM grivyzom_plugin_data \
     WHERE plugin_name = ? AND player_uuid <=> ? AND data_key = ?";

const INSERT_PLUGIN_DATA: &str = "INSERT INTO grivyzom_plugin_data \
     (plugin_name, player_uuid, data_key, data_value, data_type) VALUES (?, ?, ?, ?, ?)";

const SELECT_PLUGIN_DATA: &str = "SELECT data_value, data_type FROM grivyzom_plugin_data \
     WHERE plugin_name = ? AND player_uuid <=> ? AND data_key = ?";

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => StoreError::NoActiveConnection,
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => StoreError::Decode(error.to_string()),
            _ => StoreError::Query(error.to_string()),
        }
    }
}

/// Connection settings for the MySQL pool.
#[derive(Debug, Clone)]
pub struct MySqlSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for MySqlSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            database: "grivyzom".to_string(),
            username: "root".to_string(),
            password: String::new(),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Opens a [`MySqlPool`] from [`MySqlSettings`].
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    settings: MySqlSettings,
    options: MySqlConnectOptions,
}

impl MySqlConnector {
    pub fn new(settings: MySqlSettings) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.username)
            .password(&settings.password)
            .database(&settings.database);
        Self { settings, options }
    }

    /// Connects to the server named by a `mysql://` URL. Pool sizing still
    /// comes from `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connect`] if the URL cannot be parsed.
    pub fn from_url(url: &str, settings: MySqlSettings) -> Result<Self, StoreError> {
        let options = url
            .parse::<MySqlConnectOptions>()
            .map_err(|e| StoreError::Connect(format!("invalid database URL: {e}")))?;
        Ok(Self { settings, options })
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Connection = MySqlPool;

    fn describe(&self) -> String {
        format!(
            "mysql://{}@{}:{}/{}",
            self.options.get_username(),
            self.options.get_host(),
            self.options.get_port(),
            self.options.get_database().unwrap_or_default()
        )
    }

    async fn connect(&self) -> Result<MySqlPool, StoreError> {
        let settings = &self.settings;
        MySqlPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(settings.idle_timeout)
            .max_lifetime(settings.max_lifetime)
            .connect_with(self.options.clone())
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))
    }
}

#[async_trait]
impl StoreConnection for MySqlPool {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(self).await?;
        Ok(())
    }

    async fn close(&self) {
        sqlx::Pool::close(self).await;
    }
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q StoreValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        StoreValue::Str(s) => query.bind(s.as_str()),
        StoreValue::Int(v) => query.bind(*v),
        StoreValue::Long(v) => query.bind(*v),
        StoreValue::Double(v) => query.bind(*v),
        StoreValue::Bool(v) => query.bind(*v),
        StoreValue::Timestamp(t) => query.bind(*t),
        StoreValue::Json(v) => query.bind(v.to_string()),
        StoreValue::Null => query.bind(None::<String>),
    }
}

fn player_from_row(row: &MySqlRow) -> Result<PlayerState, StoreError> {
    let raw_id: String = row.try_get("uuid")?;
    let id = PlayerId::from_str(&raw_id)
        .map_err(|e| StoreError::Decode(format!("invalid uuid '{raw_id}': {e}")))?;
    let username: String = row.try_get("username")?;
    let display_name = row
        .try_get::<Option<String>, _>("display_name")?
        .unwrap_or_else(|| username.clone());
    let rank_id = row
        .try_get::<Option<String>, _>("rank_id")?
        .unwrap_or_else(|| DEFAULT_RANK.to_string());

    Ok(PlayerState {
        id,
        username,
        display_name,
        first_seen: row.try_get("first_join")?,
        last_seen: row.try_get("last_join")?,
        last_node: row.try_get("last_server")?,
        total_playtime_ms: row.try_get("total_playtime")?,
        coins: row.try_get("coins")?,
        gems: row.try_get("gems")?,
        rank_id,
        permissions: row.try_get("permissions")?,
        extra_data: row.try_get("data")?,
        online: row.try_get("is_online")?,
    })
}

/// [`PlayerStore`] backed by MySQL.
///
/// Every statement is parameterized. Parameters are passed as
/// [`StoreValue`]s and bound one by one.
pub struct SqlPlayerStore {
    supervisor: Arc<ConnectionSupervisor<MySqlConnector>>,
}

impl SqlPlayerStore {
    pub fn new(supervisor: Arc<ConnectionSupervisor<MySqlConnector>>) -> Self {
        Self { supervisor }
    }

    async fn execute(&self, sql: &str, params: &[StoreValue]) -> Result<u64, StoreError> {
        let pool = self.supervisor.acquire().await?;
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let result = query.execute(&pool).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_optional(
        &self,
        sql: &str,
        params: &[StoreValue],
    ) -> Result<Option<MySqlRow>, StoreError> {
        let pool = self.supervisor.acquire().await?;
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        Ok(query.fetch_optional(&pool).await?)
    }

    async fn fetch_all(&self, sql: &str, params: &[StoreValue]) -> Result<Vec<MySqlRow>, StoreError> {
        let pool = self.supervisor.acquire().await?;
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        Ok(query.fetch_all(&pool).await?)
    }

    async fn count(&self, sql: &str) -> Result<i64, StoreError> {
        let row = self
            .fetch_optional(sql, &[])
            .await?
            .ok_or_else(|| StoreError::Decode(format!("no row returned by '{sql}'")))?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Runs `work` inside a transaction on one pooled connection.
    ///
    /// Auto-commit is off for the duration of the transaction and the
    /// connection returns to the pool in auto-commit mode either way. On
    /// error the transaction is rolled back and the original error returned.
    pub async fn run_transaction<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut MySqlConnection) -> BoxFuture<'c, Result<T, StoreError>> + Send,
    {
        let pool = self.supervisor.acquire().await?;
        let mut transaction = pool.begin().await?;

        let outcome = work(&mut *transaction).await;
        match outcome {
            Ok(value) => {
                transaction
                    .commit()
                    .await
                    .map_err(|e| StoreError::Transaction(format!("commit failed: {e}")))?;
                Ok(value)
            }
            Err(e) => {
                match transaction.rollback().await {
                    Ok(()) => warn!("↩️ Transaction rolled back: {}", e),
                    Err(rollback) => error!("❌ Rollback after '{}' failed: {}", e, rollback),
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PlayerStore for SqlPlayerStore {
    async fn load_by_id(&self, id: PlayerId) -> Result<Option<PlayerState>, StoreError> {
        let sql = format!("SELECT {PLAYER_COLUMNS} FROM grivyzom_players WHERE uuid = ?");
        self.fetch_optional(&sql, &[id.to_string().into()])
            .await?
            .as_ref()
            .map(player_from_row)
            .transpose()
    }

    async fn load_by_name(&self, name: &str) -> Result<Option<PlayerState>, StoreError> {
        let sql = format!(
            "SELECT {PLAYER_COLUMNS} FROM grivyzom_players WHERE LOWER(username) = LOWER(?) LIMIT 1"
        );
        self.fetch_optional(&sql, &[name.into()])
            .await?
            .as_ref()
            .map(player_from_row)
            .transpose()
    }

    async fn upsert_on_session_start(&self, state: &PlayerState) -> Result<(), StoreError> {
        self.execute(
            UPSERT_SESSION_START,
            &[
                state.id.to_string().into(),
                state.username.as_str().into(),
                state.display_name.as_str().into(),
                state.first_seen.into(),
                state.last_seen.into(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn set_online_status(
        &self,
        id: PlayerId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.execute(
            "UPDATE grivyzom_players SET is_online = ?, last_join = ? WHERE uuid = ?",
            &[online.into(), at.into(), id.to_string().into()],
        )
        .await?;
        Ok(())
    }

    async fn set_last_node(&self, id: PlayerId, node: &str) -> Result<(), StoreError> {
        self.execute(
            "UPDATE grivyzom_players SET last_server = ? WHERE uuid = ?",
            &[node.into(), id.to_string().into()],
        )
        .await?;
        Ok(())
    }

    async fn set_coins(&self, id: PlayerId, coins: f64) -> Result<(), StoreError> {
        self.execute(
            "UPDATE grivyzom_players SET coins = ? WHERE uuid = ?",
            &[coins.into(), id.to_string().into()],
        )
        .await?;
        Ok(())
    }

    async fn set_gems(&self, id: PlayerId, gems: i32) -> Result<(), StoreError> {
        self.execute(
            "UPDATE grivyzom_players SET gems = ? WHERE uuid = ?",
            &[gems.into(), id.to_string().into()],
        )
        .await?;
        Ok(())
    }

    async fn set_rank(&self, id: PlayerId, rank_id: &str) -> Result<(), StoreError> {
        self.execute(
            "UPDATE grivyzom_players SET rank_id = ? WHERE uuid = ?",
            &[rank_id.into(), id.to_string().into()],
        )
        .await?;
        Ok(())
    }

    async fn save_full(&self, state: &PlayerState) -> Result<(), StoreError> {
        let updated = self
            .execute(
                SAVE_FULL,
                &[
                    state.coins.into(),
                    state.gems.into(),
                    state.rank_id.as_str().into(),
                    state.permissions.clone().into(),
                    state.extra_data.clone().into(),
                    state.total_playtime_ms.into(),
                    state.last_node.clone().into(),
                    state.id.to_string().into(),
                ],
            )
            .await?;

        if updated == 0 {
            debug!("save_full for {} matched no row", state.id);
        }
        Ok(())
    }

    async fn top_by_coins(&self, limit: i32) -> Result<Vec<PlayerState>, StoreError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {PLAYER_COLUMNS} FROM grivyzom_players ORDER BY coins DESC, uuid ASC LIMIT ?"
        );
        self.fetch_all(&sql, &[limit.into()])
            .await?
            .iter()
            .map(player_from_row)
            .collect()
    }

    async fn get_plugin_data(
        &self,
        plugin: &str,
        player: Option<PlayerId>,
        key: &str,
    ) -> Result<Option<StoreValue>, StoreError> {
        let row = self
            .fetch_optional(
                SELECT_PLUGIN_DATA,
                &[
                    plugin.into(),
                    player.map(|p| p.to_string()).into(),
                    key.into(),
                ],
            )
            .await?;

        match row {
            Some(row) => {
                let text: Option<String> = row.try_get("data_value")?;
                let type_tag: String = row.try_get("data_type")?;
                StoreValue::from_tagged(&type_tag, text).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn set_plugin_data(
        &self,
        plugin: &str,
        player: Option<PlayerId>,
        key: &str,
        value: &StoreValue,
    ) -> Result<(), StoreError> {
        let plugin = plugin.to_string();
        let player = player.map(|p| p.to_string());
        let key = key.to_string();
        let text = value.to_text();
        let type_tag = value.type_tag();

        // NULL player ids never collide on the unique key, so replace by hand.
        self.run_transaction(move |connection| {
            async move {
                sqlx::query(DELETE_PLUGIN_DATA)
                    .bind(plugin.as_str())
                    .bind(player.as_deref())
                    .bind(key.as_str())
                    .execute(&mut *connection)
                    .await?;
                sqlx::query(INSERT_PLUGIN_DATA)
                    .bind(plugin.as_str())
                    .bind(player.as_deref())
                    .bind(key.as_str())
                    .bind(text.as_deref())
                    .bind(type_tag)
                    .execute(&mut *connection)
                    .await?;
                Ok::<(), StoreError>(())
            }
            .boxed()
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            total_players: self.count("SELECT COUNT(*) FROM grivyzom_players").await?,
            online_players: self
                .count("SELECT COUNT(*) FROM grivyzom_players WHERE is_online = TRUE")
                .await?,
            total_nodes: self.count("SELECT COUNT(*) FROM grivyzom_servers").await?,
            plugin_data_entries: self.count("SELECT COUNT(*) FROM grivyzom_plugin_data").await?,
        })
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in [CREATE_PLAYERS_TABLE, CREATE_NODES_TABLE, CREATE_PLUGIN_DATA_TABLE] {
            self.execute(statement, &[]).await?;
        }
        info!("📋 Store schema verified");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.supervisor.is_healthy().await
    }
}
