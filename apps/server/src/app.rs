//! Wires the store, upload service, reaper and WebSocket server together.

use std::sync::Arc;

use chunkferry_server::{Reaper, UploadHandler, UploadServer, UploadService};
use chunkferry_store::SessionStore;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the daemon until Ctrl-C or a fatal server error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = {
        let path = config.database_path.clone();
        tokio::task::spawn_blocking(move || SessionStore::open(&path)).await??
    };
    let service = UploadService::new(Arc::new(store), config.service())?;

    // -- Reaper --
    let cancel = CancellationToken::new();
    let reaper = Reaper::new(service.clone(), config.reaper());
    let reaper_handle = tokio::spawn(reaper.run(cancel.clone()));

    // -- WS server --
    let server = UploadServer::new(config.server(), UploadHandler::new(service.clone()));
    let server_run = Arc::clone(&server);
    let mut server_handle = tokio::spawn(async move { server_run.run().await });

    tracing::info!("server ready");

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            Ok(())
        }
        joined = &mut server_handle => {
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::from(e)),
                Err(e) => Err(anyhow::Error::from(e)),
            }
        }
    };

    // -- Graceful shutdown --
    tracing::info!("stopping services...");
    server.shutdown();
    cancel.cancel();
    let _ = reaper_handle.await;
    service.drain().await;
    let stats = service.stats();
    tracing::info!(
        chunks_written = stats.chunks_written,
        sessions_completed = stats.sessions_completed,
        sessions_failed = stats.sessions_failed,
        "upload service stopped"
    );

    result
}
