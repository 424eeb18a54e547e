//! Node server: store, state machine, raft and the HTTP control plane

use crate::api::http::{create_router, AppState};
use crate::common::{Config, Result};
use crate::fsm::{Fsm, StateMachine, Storage};
use crate::raft::{spawn_raft, RaftHandle, RaftOptions};
use axum::ServiceExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::Layer;
use tower_http::normalize_path::NormalizePathLayer;

pub struct Node {
    config: Config,
    restore_from: Option<PathBuf>,
}

/// A started node. Dropping it does not stop it; call [`RunningNode::shutdown`].
pub struct RunningNode {
    pub http_addr: SocketAddr,
    pub raft: RaftHandle,
    pub storage: Storage,
    stop: oneshot::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
}

impl Node {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            restore_from: None,
        }
    }

    /// Seed the store from a snapshot image file before serving.
    pub fn restore_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.restore_from = Some(path.into());
        self
    }

    /// Open the store, start raft, and bind the HTTP listener.
    pub async fn start(self) -> Result<RunningNode> {
        self.config.validate()?;
        tracing::info!("Starting node: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", self.config.http_addr);
        tracing::info!("  Raft: {}", self.config.raft_addr);
        tracing::info!("  Data dir: {}", self.config.data_dir.display());

        let storage = Storage::open(self.config.store_path())?;
        let fsm = Arc::new(Fsm::new(storage.clone()));

        if let Some(path) = &self.restore_from {
            let file = std::fs::File::open(path)?;
            let restored = fsm.restore(Box::new(file))?;
            tracing::info!(
                path = %path.display(),
                restored,
                "Store seeded from snapshot image"
            );
        }

        let raft = spawn_raft(RaftOptions::from_config(&self.config), fsm).await?;

        let state = AppState::new(
            self.config.node_id.clone(),
            Arc::new(raft.clone()),
            storage.clone(),
            self.config.apply_timeout(),
        );
        let app = NormalizePathLayer::trim_trailing_slash().layer(create_router(state));

        let listener = tokio::net::TcpListener::bind(self.config.http_addr).await?;
        let http_addr = listener.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            axum::serve(
                listener,
                ServiceExt::<axum::extract::Request>::into_make_service_with_connect_info::<
                    SocketAddr,
                >(app),
            )
            .with_graceful_shutdown(async {
                let _ = stopped.await;
            })
            .await
        });

        tracing::info!(%http_addr, "Node ready");
        Ok(RunningNode {
            http_addr,
            raft,
            storage,
            stop,
            server,
        })
    }

    /// Run until Ctrl-C.
    pub async fn serve(self) -> Result<()> {
        let running = self.start().await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown signal received");
        running.shutdown().await
    }
}

impl RunningNode {
    /// Stop accepting HTTP requests, then stop raft and flush the store.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(());
        match self.server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
            Err(e) => tracing::error!("HTTP server task failed: {}", e),
        }
        self.raft.shutdown().await;
        self.storage.flush()?;
        tracing::info!("Node stopped");
        Ok(())
    }
}
