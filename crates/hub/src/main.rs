//! Entry point of the Grivyzom hub.
//!
//! Wires the supervised store, the player cache, the message bus and the
//! node listener together, then runs until a shutdown signal arrives.

mod backend;
mod cli;
mod config;
mod signals;

use backend::StoreBackend;
use cli::CliArgs;
use config::{AppConfig, LoggingSettings};
use hub_server::{HubServer, NodeRegistry};
use player_sync::{register_player_handlers, MessageBus, PlayerCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when it is set. JSON output
/// drops ANSI colors and keeps thread ids and names, which is what log
/// shippers expect.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
fn setup_logging(config: &LoggingSettings) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}

/// The running hub and the handles needed to stop it.
pub struct Application {
    config: AppConfig,
    backend: StoreBackend,
    cache: Arc<PlayerCache>,
    bus: Arc<MessageBus>,
    server: Arc<HubServer>,
}

impl Application {
    /// Loads configuration and brings every component up in dependency
    /// order.
    ///
    /// The config file is read first because the log level and format come
    /// from it; command-line flags override the file before validation.
    ///
    /// # Arguments
    ///
    /// * `args` - Parsed command-line arguments
    ///
    /// # Errors
    ///
    /// Fails on an unreadable or invalid configuration, when logging cannot
    /// be installed, or when the first store connection fails. Store outages
    /// after startup are handled by the supervisor and never surface here.
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(bind_address) = args.bind_address {
            config.hub.bind_address = bind_address;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config
            .validate()
            .map_err(|e| format!("Configuration validation failed: {}", e))?;

        setup_logging(&config.logging)?;
        info!(
            "🚀 Grivyzom Hub v{} | Config: {}",
            env!("CARGO_PKG_VERSION"),
            args.config_path.display()
        );

        let (backend, store) = StoreBackend::connect(&config, args.memory_store)
            .await
            .map_err(|e| format!("Could not connect to the {} store: {}", if args.memory_store { "memory" } else { "mysql" }, e))?;
        backend.start_health_monitor().await;
        info!("💾 Using {} store", backend.kind());

        let cache = Arc::new(PlayerCache::new(store));

        let registry = Arc::new(NodeRegistry::new());
        let bus = Arc::new(MessageBus::new(registry.clone()));
        register_player_handlers(&bus, cache.clone(), config.handler_settings()).await?;
        bus.register_channels();

        let server = Arc::new(HubServer::new(config.to_server_config()?, bus.clone(), registry));

        Ok(Self {
            config,
            backend,
            cache,
            bus,
            server,
        })
    }

    /// Serves nodes until a shutdown signal arrives, then drains.
    ///
    /// Drain order: maintenance notice (if enabled), listener stop, final
    /// flush of every cached player, channel unregistration, store close.
    ///
    /// # Errors
    ///
    /// Fails if the listener cannot bind or the signal handlers cannot be
    /// installed.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = self.server.bind()?;
        let server_handle = {
            let server = self.server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    error!("❌ Hub listener error: {}", e);
                }
            })
        };

        if self.config.messaging.announce_maintenance {
            if let Err(e) = self.bus.notify_maintenance(false).await {
                warn!("⚠️ Could not announce end of maintenance: {}", e);
            }
        }

        let auto_save = self.start_auto_save();

        info!("✅ Hub is now running on {}", self.config.hub.bind_address);
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let signal = signals::wait_for_shutdown().await?;
        info!("🛑 {} received, initiating graceful shutdown...", signal);

        if let Some(handle) = auto_save {
            handle.abort();
        }

        if self.config.messaging.announce_maintenance {
            if let Err(e) = self.bus.notify_maintenance(true).await {
                warn!("⚠️ Could not announce maintenance: {}", e);
            }
        }

        self.server.shutdown();
        if let Err(e) = server_handle.await {
            warn!("Hub listener task ended abnormally: {}", e);
        }

        let report = self.cache.flush_all().await;
        info!(
            "💾 Final flush saved {} player(s), {} failed",
            report.saved, report.failed
        );

        self.bus.unregister_channels();
        self.backend.close().await;

        let stats = self.bus.stats();
        info!(
            "📊 Messages received: {} | dispatched: {} | malformed: {} | handler failures: {}",
            stats.received, stats.dispatched, stats.malformed, stats.handler_failures
        );
        info!("👋 Hub shutdown complete");
        Ok(())
    }

    /// Spawns the periodic `flush_all` task. `None` when the interval is 0.
    fn start_auto_save(&self) -> Option<JoinHandle<()>> {
        let seconds = self.config.cache.auto_save_interval_secs;
        if seconds == 0 {
            info!("⏸️ Auto-save disabled");
            return None;
        }

        let cache = self.cache.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(seconds));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = cache.flush_all().await;
                if report.saved > 0 || report.failed > 0 {
                    info!(
                        "💾 Auto-save: {} saved, {} failed, {} online",
                        report.saved,
                        report.failed,
                        cache.len()
                    );
                }
            }
        });
        info!("🕒 Auto-save every {}s", seconds);
        Some(handle)
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start hub: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
