//! Harness for end-to-end tests: a real server on a loopback port backed by
//! a scratch directory.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chunkferry_client::{ChunkTransport, WsTransport};
use chunkferry_protocol::messages::StatusResponse;
use chunkferry_server::{ServerConfig, ServiceConfig, UploadHandler, UploadServer, UploadService};
use chunkferry_store::SessionStore;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// A running server plus the scratch space it writes to.
pub struct TestServer {
    pub url: String,
    pub service: UploadService,
    server: Arc<UploadServer<UploadHandler>>,
    handle: Option<JoinHandle<()>>,
    dir: TempDir,
}

impl TestServer {
    /// Starts a server on an OS-assigned loopback port.
    pub async fn start(chunk_size: u64) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(&dir.path().join("sessions.db")).expect("open store");
        let service = UploadService::new(
            Arc::new(store),
            ServiceConfig {
                upload_dir: dir.path().join("uploads"),
                chunk_size,
                ..Default::default()
            },
        )
        .expect("service");

        let config = ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        };
        let server = UploadServer::new(config, UploadHandler::new(service.clone()));
        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            running.run().await.expect("server run");
        });

        let mut port = 0;
        for _ in 0..200 {
            port = server.port().await;
            if port > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(port > 0, "server never bound");

        Self {
            url: format!("ws://127.0.0.1:{port}"),
            service,
            server,
            handle: Some(handle),
            dir,
        }
    }

    pub async fn connect(&self) -> Arc<WsTransport> {
        Arc::new(WsTransport::connect(&self.url).await.expect("connect"))
    }

    /// Writes a file of `len` patterned bytes into the scratch space.
    pub fn write_source(&self, name: &str, len: usize) -> PathBuf {
        let src = self.dir.path().join("src");
        std::fs::create_dir_all(&src).expect("mkdir");
        let path = src.join(name);
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 253) as u8).collect();
        std::fs::write(&path, data).expect("write source");
        path
    }

    pub async fn stop(mut self) {
        self.server.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.service.drain().await;
    }
}

/// Polls the status of `path` until the session is `COMPLETED` or `FAILED`.
pub async fn wait_for_terminal(transport: &dyn ChunkTransport, path: &Path) -> StatusResponse {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .expect("file name")
        .to_string();
    let size = std::fs::metadata(path).expect("metadata").len();
    for _ in 0..200 {
        let status = transport.status(&name, size).await.expect("status");
        if status.status.is_some_and(|s| s.is_terminal()) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("session for {name} never finished");
}
