//! Main sync server.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handler::create_router;
use axum::Router;
use scopesync_engine::SyncPeer;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The sync server.
///
/// Serves a [`SyncPeer`] over HTTP and periodically reaps sessions that
/// clients abandoned without ending them.
#[derive(Debug, Clone)]
pub struct SyncServer {
    config: ServerConfig,
    peer: Arc<SyncPeer>,
}

impl SyncServer {
    /// Creates a new sync server.
    pub fn new(config: ServerConfig, peer: Arc<SyncPeer>) -> Self {
        Self { config, peer }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the served peer.
    pub fn peer(&self) -> &Arc<SyncPeer> {
        &self.peer
    }

    /// Builds the router.
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.peer), self.config.max_body_bytes)
    }

    /// Starts the session reaper. It stops when `shutdown` is cancelled.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let peer = Arc::clone(&self.peer);
        let interval = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = peer.purge_expired();
                        if reaped > 0 {
                            tracing::info!(reaped, "reaped idle sync sessions");
                        }
                    }
                }
            }
        })
    }

    /// Binds the configured address and serves until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> ServerResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_on(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` is cancelled.
    pub async fn serve_on(self, listener: TcpListener, shutdown: CancellationToken) -> ServerResult<()> {
        let reaper = self.spawn_reaper(shutdown.clone());
        tracing::info!(addr = %listener.local_addr()?, "sync server listening");

        let signal = shutdown.clone();
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;

        shutdown.cancel();
        if let Err(err) = reaper.await {
            tracing::warn!(error = %err, "session reaper ended abnormally");
        }
        served?;
        tracing::info!("sync server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopesync_engine::{MemoryProvider, PeerConfig};
    use scopesync_protocol::SyncSetup;
    use scopesync_store::MemoryScopeStore;
    use std::time::Duration;

    fn peer() -> Arc<SyncPeer> {
        let peer = SyncPeer::new(
            PeerConfig::new().with_setup("main", SyncSetup::new(["Product"])),
            Arc::new(MemoryScopeStore::new()),
            Arc::new(MemoryProvider::new()),
        )
        .unwrap();
        Arc::new(peer)
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let server = SyncServer::new(
            ServerConfig::default().with_reap_interval(Duration::from_millis(5)),
            peer(),
        );
        let shutdown = CancellationToken::new();
        let reaper = server.spawn_reaper(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), reaper)
            .await
            .unwrap()
            .unwrap();
    }
}
