#![allow(dead_code)]

use coderelay::{
    ContainerLauncher, DirUploadStore, LaunchSpec, Launcher, OutputSummary, Relay, RelayConfig,
    RelayHandle, SandboxConfig, ServerMessage, Stager,
};
use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Runs staged scripts with `sh`, in the data directory when one is mounted.
#[derive(Default)]
pub struct ShellLauncher {
    pub launches: AtomicUsize,
    pub mounts: Mutex<Vec<Option<PathBuf>>>,
    /// Program to run instead of `sh`.
    pub program: Option<String>,
    /// Classify exits the way a container runtime named `sh` would.
    pub container_rules: bool,
}

impl Launcher for ShellLauncher {
    fn command(&self, spec: &LaunchSpec<'_>) -> Command {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.mounts
            .lock()
            .unwrap()
            .push(spec.mount.map(Path::to_path_buf));

        let mut cmd = Command::new(self.program.as_deref().unwrap_or("sh"));
        cmd.arg(spec.script);
        if let Some(dir) = spec.mount {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn is_launch_failure(&self, status: &ExitStatus, output: &OutputSummary) -> bool {
        self.container_rules
            && ContainerLauncher::new(SandboxConfig {
                runtime: "sh".to_string(),
                ..SandboxConfig::default()
            })
            .is_launch_failure(status, output)
    }
}

pub struct TestRelay {
    pub handle: RelayHandle,
    pub launcher: Arc<ShellLauncher>,
    pub scratch: TempDir,
    /// The relay's own subdirectory of `scratch`.
    pub scratch_dir: PathBuf,
    pub uploads: TempDir,
}

impl TestRelay {
    pub async fn start(config: RelayConfig) -> Self {
        Self::with_launcher(config, ShellLauncher::default()).await
    }

    pub async fn with_launcher(config: RelayConfig, launcher: ShellLauncher) -> Self {
        let scratch = TempDir::new().unwrap();
        let uploads = TempDir::new().unwrap();
        let store = DirUploadStore::open(uploads.path()).unwrap();
        let stager = Stager::open(scratch.path(), "sh")
            .unwrap()
            .with_upload_store(Arc::new(store));
        let scratch_dir = stager.dir().to_path_buf();
        let launcher = Arc::new(launcher);
        let handle = Relay::new(config, stager, launcher.clone())
            .start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        Self {
            handle,
            launcher,
            scratch,
            scratch_dir,
            uploads,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.handle.local_addr())
    }

    pub async fn connect(&self) -> Ws {
        let (ws, _) = tokio_tungstenite::connect_async(self.url()).await.unwrap();
        ws
    }

    pub fn scratch_files(&self) -> usize {
        count_files(&self.scratch_dir)
    }

    pub fn launches(&self) -> usize {
        self.launcher.launches.load(Ordering::SeqCst)
    }

    /// Wait until every session has been cleaned up.
    pub async fn settle(&self) {
        let settled = wait_until(Duration::from_secs(10), || async move {
            self.handle.active_sessions().await == 0 && self.scratch_files() == 0
        })
        .await;
        assert!(settled, "sessions did not settle");
    }
}

pub fn test_config() -> RelayConfig {
    RelayConfig {
        deadline: Duration::from_secs(10),
        grace_period: Duration::from_millis(500),
        ..RelayConfig::default()
    }
}

pub async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

pub async fn execute(ws: &mut Ws, code: &str) {
    send_json(ws, serde_json::json!({ "code": code })).await;
}

/// Next text frame, parsed as a tagged server message.
pub async fn next_message(ws: &mut Ws) -> ServerMessage {
    let text = next_text(ws).await;
    serde_json::from_str(&text).unwrap_or_else(|e| panic!("bad message {text:?}: {e}"))
}

pub async fn next_text(ws: &mut Ws) -> String {
    loop {
        let frame = tokio::time::timeout(MESSAGE_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return text,
            Message::Close(_) => panic!("connection closed"),
            _ => continue,
        }
    }
}

/// Collect messages until `exits` sessions have sent their exit message.
pub async fn collect_until_exits(ws: &mut Ws, exits: usize) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    let mut seen = 0;
    while seen < exits {
        let message = next_message(ws).await;
        if matches!(message, ServerMessage::Exit { .. }) {
            seen += 1;
        }
        messages.push(message);
    }
    messages
}

/// Concatenated output of one stream.
pub fn output_of(messages: &[ServerMessage], wanted: coderelay::StreamKind) -> String {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Output { stream, data, .. } if *stream == wanted => Some(data.as_str()),
            _ => None,
        })
        .collect()
}

pub fn stdout_of(messages: &[ServerMessage]) -> String {
    output_of(messages, coderelay::StreamKind::Stdout)
}

pub fn exit_of(messages: &[ServerMessage]) -> &ServerMessage {
    messages
        .iter()
        .find(|m| matches!(m, ServerMessage::Exit { .. }))
        .expect("no exit message")
}

pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > limit {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Entries in `dir`; a directory that is gone holds nothing.
pub fn count_files(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => panic!("cannot list {dir:?}: {e}"),
    }
}

pub fn process_exists(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
