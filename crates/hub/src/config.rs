//! Configuration management for the hub.
//!
//! Settings are read from a TOML file, overridden by command-line flags and
//! converted into the typed configs of the store, the handlers and the
//! listener.

use hub_server::HubServerConfig;
use player_sync::{HandlerSettings, MySqlSettings, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

fn default_hub_tag() -> String {
    "hub".to_string()
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_auto_save_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Application configuration loaded from a TOML file.
///
/// Every section is optional in the file; a missing section takes its
/// defaults, so an empty file describes a hub on `127.0.0.1:25590` backed by
/// a local MySQL database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node listener settings
    #[serde(default)]
    pub hub: HubSettings,
    /// Backing store connection and health settings
    #[serde(default)]
    pub database: DatabaseSettings,
    /// Player cache persistence settings
    #[serde(default)]
    pub cache: CacheSettings,
    /// Broadcast behavior towards nodes
    #[serde(default)]
    pub messaging: MessagingSettings,
    /// Logging output settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Listener settings.
///
/// Controls where nodes connect and how long they have to identify
/// themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Address nodes connect to (e.g. "0.0.0.0:25590")
    pub bind_address: String,
    /// Sender tag this hub puts in PONG replies
    #[serde(default = "default_hub_tag")]
    pub hub_tag: String,
    /// Seconds a node has to announce its name
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:25590".to_string(),
            hub_tag: default_hub_tag(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

/// Backing store settings.
///
/// Connection target and pool sizing for MySQL, plus the timing of the
/// supervisor's health probe. Ignored apart from the probe timing when the
/// hub runs with `--memory-store`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// MySQL server host name or address
    pub host: String,
    /// MySQL server port
    pub port: u16,
    /// Schema holding the `grivyzom_*` tables
    pub database: String,
    /// Account the hub logs in as
    pub username: String,
    /// Password for `username` (empty for none)
    #[serde(default)]
    pub password: String,
    /// Upper bound on pooled connections
    pub max_connections: u32,
    /// Connections kept open while idle
    pub min_connections: u32,
    /// Run the table DDL at startup instead of relying on a
    /// pre-provisioned schema
    #[serde(default)]
    pub create_schema: bool,
    /// Seconds between two health probes
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Seconds a single probe may take before it counts as failed
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let mysql = MySqlSettings::default();
        Self {
            host: mysql.host,
            port: mysql.port,
            database: mysql.database,
            username: mysql.username,
            password: mysql.password,
            max_connections: mysql.max_connections,
            min_connections: mysql.min_connections,
            create_schema: false,
            health_check_interval_secs: default_health_check_interval(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

/// Player cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Seconds between two flushes of every cached player (0 to disable)
    #[serde(default = "default_auto_save_interval")]
    pub auto_save_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            auto_save_interval_secs: default_auto_save_interval(),
        }
    }
}

/// Messaging settings.
///
/// Decides which hub-initiated broadcasts reach the nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingSettings {
    /// Broadcast PLAYER_UPDATE after balance and rank changes
    #[serde(default = "default_true")]
    pub broadcast_updates: bool,
    /// Broadcast MAINTENANCE START/END around startup and shutdown
    #[serde(default)]
    pub announce_maintenance: bool,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            broadcast_updates: true,
            announce_maintenance: false,
        }
    }
}

/// Logging system configuration.
///
/// `RUST_LOG`, when set, takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file does not exist, the default configuration is written to
    /// `path` so operators have a template to edit, and returned.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration. It is not validated; call
    /// [`validate`](Self::validate) after applying command-line overrides.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or written, or is not valid TOML
    /// for this structure.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Checks the configuration for values the hub cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first offending setting: an unparsable
    /// bind address, an empty hub tag or database target, a pool whose
    /// minimum exceeds its maximum, zero intervals, a probe timeout that does
    /// not fit inside the health check interval, or an unknown log level.
    pub fn validate(&self) -> Result<(), String> {
        if self.hub.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.hub.bind_address));
        }
        if self.hub.hub_tag.is_empty() {
            return Err("Hub tag cannot be empty".to_string());
        }
        if self.hub.handshake_timeout_secs == 0 {
            return Err("Handshake timeout must be at least one second".to_string());
        }

        if self.database.host.is_empty() {
            return Err("Database host cannot be empty".to_string());
        }
        if self.database.database.is_empty() {
            return Err("Database name cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than zero".to_string());
        }
        if self.database.min_connections > self.database.max_connections {
            return Err("Database min_connections cannot exceed max_connections".to_string());
        }
        if self.database.health_check_interval_secs == 0 {
            return Err("Health check interval must be at least one second".to_string());
        }
        if self.database.probe_timeout_secs == 0
            || self.database.probe_timeout_secs >= self.database.health_check_interval_secs
        {
            return Err("Probe timeout must be non-zero and shorter than the health check interval".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    /// Converts the listener section into the node server's configuration.
    ///
    /// # Errors
    ///
    /// Fails if `hub.bind_address` is not a socket address.
    pub fn to_server_config(&self) -> Result<HubServerConfig, Box<dyn std::error::Error>> {
        Ok(HubServerConfig {
            bind_address: self.hub.bind_address.parse()?,
            handshake_timeout: Duration::from_secs(self.hub.handshake_timeout_secs),
            ..HubServerConfig::default()
        })
    }

    /// Connection settings for the MySQL connector. Pool timeouts keep their
    /// library defaults.
    pub fn to_mysql_settings(&self) -> MySqlSettings {
        MySqlSettings {
            host: self.database.host.clone(),
            port: self.database.port,
            database: self.database.database.clone(),
            username: self.database.username.clone(),
            password: self.database.password.clone(),
            max_connections: self.database.max_connections,
            min_connections: self.database.min_connections,
            ..MySqlSettings::default()
        }
    }

    /// Probe timing for the connection supervisor.
    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            health_check_interval: Duration::from_secs(self.database.health_check_interval_secs),
            probe_timeout: Duration::from_secs(self.database.probe_timeout_secs),
            ..SupervisorConfig::default()
        }
    }

    /// Settings for the built-in request handlers. The version tag is the
    /// crate version and cannot be configured.
    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            hub_tag: self.hub.hub_tag.clone(),
            broadcast_updates: self.messaging.broadcast_updates,
            ..HandlerSettings::default()
        }
    }
}
