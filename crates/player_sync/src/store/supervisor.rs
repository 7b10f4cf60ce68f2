use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A live handle to the backing store.
///
/// Handles are cheap to clone; every clone refers to the same underlying
/// connection or pool.
#[async_trait]
pub trait StoreConnection: Clone + Send + Sync + 'static {
    /// Liveness probe. The supervisor bounds it with a timeout.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Releases the connection. Errors are swallowed by implementations.
    async fn close(&self);
}

/// Knows how to open a [`StoreConnection`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: StoreConnection;

    /// Short description of the target for logs. Must not contain credentials.
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Self::Connection, StoreError>;
}

/// Timing knobs of the [`ConnectionSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between two health probes of the background monitor.
    pub health_check_interval: Duration,
    /// Upper bound for a single liveness probe.
    pub probe_timeout: Duration,
    /// How long `close` waits for the monitor task before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Observable state of the supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connection is held and was healthy at the last probe.
    Connected,
    /// The last probe failed and no replacement connection could be opened.
    Degraded,
    /// `close` was called. Terminal.
    Closed,
}

struct HealthMonitor {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the single connection to the backing store and keeps it usable.
///
/// A background monitor probes the connection on a fixed interval. On a
/// failed probe the stale connection is closed and exactly one reconnect is
/// attempted; if that fails the supervisor stays degraded until the next
/// tick. Callers never wait for a repair: [`acquire`](Self::acquire) fails
/// immediately with [`StoreError::NoActiveConnection`] while degraded.
pub struct ConnectionSupervisor<C: Connector> {
    connector: C,
    config: SupervisorConfig,
    connection: RwLock<Option<C::Connection>>,
    closed: AtomicBool,
    reconnects: AtomicU64,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl<C: Connector> ConnectionSupervisor<C> {
    /// Opens the first connection.
    ///
    /// # Errors
    ///
    /// The connect error is returned as-is. A store that is unreachable at
    /// startup is fatal for the caller.
    pub async fn connect(connector: C, config: SupervisorConfig) -> Result<Arc<Self>, StoreError> {
        let target = connector.describe();
        info!("🔌 Connecting to backing store at {}", target);

        let connection = connector.connect().await.map_err(|e| {
            error!("❌ Initial connection to {} failed: {}", target, e);
            e
        })?;

        info!("✅ Connected to backing store at {}", target);

        Ok(Arc::new(Self {
            connector,
            config,
            connection: RwLock::new(Some(connection)),
            closed: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            monitor: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// The live connection handle.
    pub async fn acquire(&self) -> Result<C::Connection, StoreError> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(StoreError::NoActiveConnection)
    }

    pub async fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Closed
        } else if self.connection.read().await.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Degraded
        }
    }

    /// Number of successful reconnects since startup.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Probes the current connection within the configured timeout.
    pub async fn is_healthy(&self) -> bool {
        match self.acquire().await {
            Ok(connection) => self.probe(&connection).await,
            Err(_) => false,
        }
    }

    async fn probe(&self, connection: &C::Connection) -> bool {
        match tokio::time::timeout(self.config.probe_timeout, connection.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Health probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Health probe timed out after {:?}", self.config.probe_timeout);
                false
            }
        }
    }

    /// Runs one iteration of the health loop and returns the resulting state.
    pub async fn run_health_check(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            return ConnectionState::Closed;
        }

        if self.is_healthy().await {
            return ConnectionState::Connected;
        }

        warn!("⚠️ Backing store connection is unhealthy, reconnecting");

        let stale = self.connection.write().await.take();
        if let Some(stale) = stale {
            stale.close().await;
        }

        match self.connector.connect().await {
            Ok(connection) => {
                let mut slot = self.connection.write().await;
                if self.closed.load(Ordering::SeqCst) {
                    drop(slot);
                    connection.close().await;
                    return ConnectionState::Closed;
                }
                *slot = Some(connection);
                self.reconnects.fetch_add(1, Ordering::Relaxed);
                info!("✅ Reconnected to backing store at {}", self.connector.describe());
                ConnectionState::Connected
            }
            Err(e) => {
                error!("❌ Reconnect failed, store stays degraded: {}", e);
                ConnectionState::Degraded
            }
        }
    }

    /// Spawns the background health monitor. Calling it again while a
    /// monitor is running, or after `close`, does nothing.
    pub async fn start_health_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }

        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let supervisor = Arc::downgrade(self);
        let period = self.config.health_check_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(supervisor) = supervisor.upgrade() else {
                            break;
                        };
                        supervisor.run_health_check().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            debug!("Health monitor stopped");
        });

        *monitor = Some(HealthMonitor { shutdown, task });
        info!("🩺 Store health monitor started (every {:?})", period);
    }

    /// Stops the monitor and closes the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let monitor = self.monitor.lock().await.take();
        if let Some(HealthMonitor { shutdown, mut task }) = monitor {
            let _ = shutdown.send(());
            if tokio::time::timeout(self.config.shutdown_grace, &mut task)
                .await
                .is_err()
            {
                warn!(
                    "Health monitor did not stop within {:?}, aborting it",
                    self.config.shutdown_grace
                );
                task.abort();
            }
        }

        let connection = self.connection.write().await.take();
        if let Some(connection) = connection {
            connection.close().await;
        }

        info!("🔒 Backing store connection closed");
    }
}
