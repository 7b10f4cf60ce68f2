//! Shutdown signal handling for the hub.
//!
//! The hub drains in a fixed order once a signal arrives (maintenance
//! notice, listener stop, final flush, store close), so the signal itself
//! only has to be observed once and reported back to the caller.

use std::fmt;
use tokio::signal;
use tracing::info;

/// The signal that asked the hub to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT on Unix, Ctrl+C on Windows.
    Interrupt,
    /// SIGTERM, as sent by service managers and container runtimes.
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Waits until the process is asked to shut down.
///
/// On Unix both SIGINT and SIGTERM are watched and whichever arrives first
/// wins. On Windows only Ctrl+C is available and is reported as
/// [`ShutdownSignal::Interrupt`].
///
/// # Returns
///
/// The signal that was received.
///
/// # Errors
///
/// Fails if the signal handlers cannot be installed, which leaves the hub
/// without a way to stop gracefully; the caller treats it as fatal.
pub async fn wait_for_shutdown() -> Result<ShutdownSignal, Box<dyn std::error::Error>> {
    #[cfg(unix)]
    let received = {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => ShutdownSignal::Interrupt,
            _ = sigterm.recv() => ShutdownSignal::Terminate,
        }
    };

    #[cfg(windows)]
    let received = {
        signal::ctrl_c().await?;
        ShutdownSignal::Interrupt
    };

    info!("📡 Received {}", received);
    Ok(received)
}
