//! Selection of the backing store the hub runs against.

use crate::config::AppConfig;
use player_sync::{
    ConnectionSupervisor, MemoryConnector, MemoryDatabase, MemoryPlayerStore, MySqlConnector,
    PlayerStore, SqlPlayerStore, StoreError,
};
use std::sync::Arc;
use tracing::info;

/// The supervisor of whichever store was configured.
pub enum StoreBackend {
    MySql(Arc<ConnectionSupervisor<MySqlConnector>>),
    Memory(Arc<ConnectionSupervisor<MemoryConnector>>),
}

impl StoreBackend {
    /// Opens the supervised connection and builds the store on top of it.
    ///
    /// With `memory` set the hub keeps everything in process and the
    /// database section is only used for probe timing.
    ///
    /// # Errors
    ///
    /// Fails if the first connection attempt fails, or if
    /// `database.create_schema` is on and the DDL cannot run.
    pub async fn connect(
        config: &AppConfig,
        memory: bool,
    ) -> Result<(Self, Arc<dyn PlayerStore>), StoreError> {
        let supervisor_config = config.to_supervisor_config();

        let (backend, store): (Self, Arc<dyn PlayerStore>) = if memory {
            let connector = MemoryConnector::new(Arc::new(MemoryDatabase::new()));
            let supervisor = ConnectionSupervisor::connect(connector, supervisor_config).await?;
            let store = Arc::new(MemoryPlayerStore::new(supervisor.clone()));
            (Self::Memory(supervisor), store)
        } else {
            let connector = MySqlConnector::new(config.to_mysql_settings());
            let supervisor = ConnectionSupervisor::connect(connector, supervisor_config).await?;
            let store = Arc::new(SqlPlayerStore::new(supervisor.clone()));
            (Self::MySql(supervisor), store)
        };

        if config.database.create_schema {
            store.ensure_schema().await?;
            info!("🗄️ Schema ensured on {} store", backend.kind());
        }

        Ok((backend, store))
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MySql(_) => "mysql",
            Self::Memory(_) => "memory",
        }
    }

    /// Starts the supervisor's periodic probe. Calling it twice is a no-op.
    pub async fn start_health_monitor(&self) {
        match self {
            Self::MySql(supervisor) => supervisor.start_health_monitor().await,
            Self::Memory(supervisor) => supervisor.start_health_monitor().await,
        }
    }

    /// Stops the probe and closes the connection. Later store calls fail
    /// with `NoActiveConnection`.
    pub async fn close(&self) {
        match self {
            Self::MySql(supervisor) => supervisor.close().await,
            Self::Memory(supervisor) => supervisor.close().await,
        }
    }
}
