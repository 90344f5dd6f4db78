//! Server lifecycle: bind, serve, drain, stop.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use relay_config::ServerSettings;

use crate::routes::router;
use crate::shutdown::shutdown_signal;
use crate::state::AppState;

/// Errors raised while bringing the server up or tearing it down.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configured host and port did not form a socket address.
    #[error("invalid listen address {address}: {source}")]
    Address {
        /// The `host:port` string that failed to parse.
        address: String,
        /// Parse failure.
        #[source]
        source: std::net::AddrParseError,
    },

    /// The listener could not bind, usually because the port is taken.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// The resolved address.
        address: SocketAddr,
        /// Bind failure.
        #[source]
        source: std::io::Error,
    },

    /// The accept loop failed after startup.
    #[error("server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// Binds the listener and serves until SIGINT or SIGTERM.
///
/// On a signal the listener stops accepting and in-flight requests get
/// `graceful_shutdown_timeout` to finish; connections still open after
/// the grace period are dropped.
pub async fn serve(state: AppState, settings: &ServerSettings) -> Result<(), ServerError> {
    let address: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .map_err(|source| ServerError::Address {
            address: format!("{}:{}", settings.host, settings.port),
            source,
        })?;

    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| ServerError::Bind { address, source })?;
    info!(%address, "gateway listening");

    let app = router(state, settings);
    let grace = settings.graceful_shutdown_timeout;

    let (drain_tx, drain_rx) = watch::channel(false);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = drain_tx.send(true);
    });

    tokio::select! {
        result = server => result?,
        () = drain_deadline(drain_rx, grace) => {
            warn!(grace = ?grace, "drain deadline elapsed, dropping remaining connections");
        }
    }
    info!("gateway stopped");
    Ok(())
}

/// Pending until the drain starts, then completes after the grace period.
async fn drain_deadline(mut drain: watch::Receiver<bool>, grace: Duration) {
    if drain.wait_for(|draining| *draining).await.is_ok() {
        tokio::time::sleep(grace).await;
    } else {
        // Sender dropped without signaling: the server already exited on
        // its own, nothing to time out.
        std::future::pending::<()>().await;
    }
}
