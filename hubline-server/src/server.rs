//! Server state and HTTP/WebSocket listener.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::db::SqliteStore;
use crate::group::GroupChatCoordinator;
use crate::presence::PresenceReporter;
use crate::registry::ConnectionRegistry;
use crate::store::{Storage, StoreError};

/// Shared state accessible by all connection handlers.
pub struct SharedState {
    pub config: ServerConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: PresenceReporter,
    pub coordinator: GroupChatCoordinator,
    /// Cancelled once to stop the listener and every connection task.
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl SharedState {
    /// Wire the registry, presence reporter and coordinator together and
    /// hydrate groups from `store`.
    pub fn new(config: ServerConfig, store: Arc<dyn Storage>) -> Result<Arc<Self>, StoreError> {
        let registry = Arc::new(ConnectionRegistry::new());
        let coordinator =
            GroupChatCoordinator::new(store, Arc::clone(&registry), config.max_message_len);
        let groups = coordinator.load()?;
        tracing::info!(groups, "loaded groups from storage");

        Ok(Arc::new(Self {
            presence: PresenceReporter::new(Arc::clone(&registry)),
            registry,
            coordinator,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
            config,
        }))
    }
}

pub struct Server {
    config: ServerConfig,
    store: Option<Arc<dyn Storage>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            store: None,
        }
    }

    /// Create a server over an existing store (for testing).
    pub fn with_store(config: ServerConfig, store: Arc<dyn Storage>) -> Self {
        Self {
            config,
            store: Some(store),
        }
    }

    /// Build SharedState, opening the database and loading persisted groups.
    fn build_state(&self) -> Result<Arc<SharedState>> {
        let store: Arc<dyn Storage> = match (&self.store, &self.config.db_path) {
            (Some(store), _) => Arc::clone(store),
            (None, Some(path)) => {
                tracing::info!("Opening database: {path}");
                Arc::new(
                    SqliteStore::open(path)
                        .with_context(|| format!("failed to open database {path}"))?,
                )
            }
            (None, None) => {
                tracing::warn!("No database configured, groups and messages are kept in memory");
                Arc::new(SqliteStore::open_memory().context("failed to open in-memory database")?)
            }
        };
        SharedState::new(self.config.clone(), store).context("failed to load groups")
    }

    /// Run the server until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        tracing::info!("Listening on {}", listener.local_addr()?);

        serve(listener, state, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
        })
        .await
    }

    /// Start the server and return the bound address, its state and the
    /// task handle (for testing). Cancel `state.shutdown` to stop it.
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state()?;
        let signal = state.shutdown.clone().cancelled_owned();
        let handle = tokio::spawn(serve(listener, Arc::clone(&state), signal));
        Ok((addr, state, handle))
    }
}

async fn serve(
    listener: TcpListener,
    state: Arc<SharedState>,
    signal: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = crate::web::router(Arc::clone(&state));
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal.await;
            shutdown.cancel();
        })
        .await
        .context("HTTP server error")?;

    state.registry.shutdown();
    tracing::info!("server stopped");
    Ok(())
}
