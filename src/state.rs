//! Shared relay state and the live-session registry.

use crate::config::RelayConfig;
use crate::sandbox::Launcher;
use crate::stager::Stager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock, Semaphore};
use uuid::Uuid;

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Staged,
    Running,
    Completed,
    TimedOut,
    Aborted,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Staged | SessionState::Running)
    }
}

/// Registry entry for a live session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub state: SessionState,
    pub created_at: Instant,
}

/// Thread-safe session registry.
pub type Sessions = Arc<RwLock<HashMap<Uuid, SessionEntry>>>;

/// Shared relay state, cloned into every connection and session.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub stager: Arc<Stager>,
    pub launcher: Arc<dyn Launcher>,
    pub admission: Arc<Semaphore>,
    pub sessions: Sessions,
    /// Flips to `true` when the relay is stopping.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        config: RelayConfig,
        stager: Stager,
        launcher: Arc<dyn Launcher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config: Arc::new(config),
            stager: Arc::new(stager),
            launcher,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }
}

/// Resolves once `rx` holds `true` or its sender is gone.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        let set = *rx.borrow_and_update();
        if set || rx.changed().await.is_err() {
            return;
        }
    }
}
