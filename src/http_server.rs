//! HTTP/websocket front of the relay, using Axum.

use crate::config::RelayConfig;
use crate::error::Result;
use crate::protocol::{ExecutionRequest, ServerMessage};
use crate::relay::Outbox;
use crate::router;
use crate::sandbox::Launcher;
use crate::session;
use crate::stager::Stager;
use crate::state::{self, AppState, SessionState};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

#[derive(Serialize)]
struct SessionInfo {
    id: Uuid,
    state: SessionState,
    age_secs: u64,
}

/// A relay instance. Instances share nothing, so several can run in one
/// process.
pub struct Relay {
    state: AppState,
    shutdown: watch::Sender<bool>,
}

impl Relay {
    pub fn new(config: RelayConfig, stager: Stager, launcher: Arc<dyn Launcher>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            state: AppState::new(config, stager, launcher, shutdown_rx),
            shutdown,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    fn app(&self) -> Router {
        Router::new()
            .route("/", get(execute_ws))
            .route("/ws", get(execute_ws))
            .route("/sessions", get(list_sessions))
            .route("/health", get(health))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Run one request outside any connection, reporting on `outbox`.
    pub async fn execute(&self, request: ExecutionRequest, outbox: Outbox) {
        session::run(self.state.clone(), request, outbox, self.shutdown.subscribe()).await;
    }

    /// Bind `addr` and start serving in the background.
    pub async fn start(self, addr: SocketAddr) -> Result<RelayHandle> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Starting relay on {}", local_addr);

        let app = self.app();
        let mut stop = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { state::signalled(&mut stop).await })
                .await
        });

        Ok(RelayHandle {
            local_addr,
            state: self.state,
            shutdown: self.shutdown,
            task,
        })
    }
}

/// A running relay. Dropping the handle stops it as well.
pub struct RelayHandle {
    local_addr: SocketAddr,
    state: AppState,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of sessions that have been staged and not yet cleaned up.
    pub async fn active_sessions(&self) -> usize {
        self.state.sessions.read().await.len()
    }

    /// Stop accepting connections, abort every session and wait for the
    /// server to wind down.
    pub async fn stop(self) -> Result<()> {
        info!("Stopping relay on {}", self.local_addr);
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(served) => served?,
            Err(e) => return Err(std::io::Error::other(e).into()),
        }
        Ok(())
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let sessions = state.sessions.read().await;
    let now = Instant::now();
    let list = sessions
        .iter()
        .map(|(id, entry)| SessionInfo {
            id: *id,
            state: entry.state,
            age_secs: now.duration_since(entry.created_at).as_secs(),
        })
        .collect();
    Json(list)
}

async fn execute_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max = state.config.max_message_bytes();
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| router::serve_connection(socket, state))
}
