//! Lifecycle supervision of a single execution.
//!
//! A session moves `Staged -> Running -> {Completed, TimedOut, Aborted,
//! Failed}`. Whatever the terminal state, [`ExecutionSession::teardown`]
//! runs exactly once before the caller hears about it, and the `Drop` impl
//! releases the process and the staged file if the task is cancelled
//! before getting there.

use crate::error::RelayError;
use crate::protocol::{ExecutionRequest, ServerMessage, StreamKind};
use crate::relay::{self, Delivery, OutputRelay, Outbox, READ_CHUNK};
use crate::sandbox::{self, LaunchSpec, SandboxProcess};
use crate::stager;
use crate::state::{self, AppState, SessionEntry, SessionState};
use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::time::{Duration, Instant as StdInstant};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on reaping a process after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the output loop stopped.
enum Ending {
    Exited,
    Deadline,
    Disconnected,
}

/// Admit, run and clean up one request. Errors are reported on `outbox`;
/// nothing escapes to the caller.
pub async fn run(
    app: AppState,
    request: ExecutionRequest,
    outbox: Outbox,
    mut abort: watch::Receiver<bool>,
) {
    let id = Uuid::new_v4();
    let request_id = request.request_id.clone();

    let permit = tokio::select! {
        acquired = tokio::time::timeout(
            app.config.admission_wait,
            app.admission.clone().acquire_owned(),
        ) => match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return,
            Err(_) => {
                let err = RelayError::Busy(app.config.max_concurrent);
                warn!(session = %id, "Rejected: {}", err);
                let _ = outbox.send(ServerMessage::error(None, request_id, &err)).await;
                return;
            }
        },
        _ = state::signalled(&mut abort) => return,
    };

    let mut session = ExecutionSession::new(id, request_id, app, outbox);
    let result = session.execute(request, &mut abort).await;
    session.finish(result).await;
    drop(permit);
}

/// One execution: its staged script, its sandbox and the cleanup of both.
pub struct ExecutionSession {
    id: Uuid,
    request_id: Option<String>,
    app: AppState,
    outbox: Outbox,
    created_at: StdInstant,
    deadline: Option<Instant>,
    state: Option<SessionState>,
    script: Option<PathBuf>,
    process: Option<SandboxProcess>,
    stdin_task: Option<JoinHandle<()>>,
    /// Set when termination was forced and the sandbox may have leftovers.
    forced: bool,
    cleaned: bool,
}

impl ExecutionSession {
    fn new(id: Uuid, request_id: Option<String>, app: AppState, outbox: Outbox) -> Self {
        Self {
            id,
            request_id,
            app,
            outbox,
            created_at: StdInstant::now(),
            deadline: None,
            state: None,
            script: None,
            process: None,
            stdin_task: None,
            forced: false,
            cleaned: false,
        }
    }

    async fn transition(&mut self, next: SessionState) {
        debug!(session = %self.id, from = ?self.state, to = ?next, "Session transition");
        self.state = Some(next);
        self.app.sessions.write().await.insert(
            self.id,
            SessionEntry {
                state: next,
                created_at: self.created_at,
            },
        );
    }

    async fn execute(
        &mut self,
        request: ExecutionRequest,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<SessionState, RelayError> {
        let script = self.app.stager.stage(self.id, &request.code).await?;
        self.script = Some(script.clone());
        self.transition(SessionState::Staged).await;

        let mount = self
            .app
            .stager
            .resolve_mount(request.user_id.as_deref())
            .await;
        let name = self.id.to_string();
        let spec = LaunchSpec {
            name: &name,
            script: &script,
            mount: mount.as_deref(),
        };
        let mut process = sandbox::launch(self.app.launcher.as_ref(), &spec)?;

        self.deadline = Some(Instant::now() + self.app.config.deadline);
        if let Some(stdin) = process.stdin.take() {
            self.stdin_task = Some(tokio::spawn(relay::feed_stdin(
                self.id,
                stdin,
                request.inputs,
            )));
        }
        self.process = Some(process);
        self.transition(SessionState::Running).await;
        info!(
            session = %self.id,
            user = ?request.user_id,
            mounted = mount.is_some(),
            "Session running"
        );

        let _ = self
            .outbox
            .send(ServerMessage::Started {
                session: self.id,
                request_id: self.request_id.clone(),
            })
            .await;

        self.supervise(abort).await
    }

    async fn supervise(
        &mut self,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<SessionState, RelayError> {
        let deadline = self
            .deadline
            .unwrap_or_else(|| Instant::now() + self.app.config.deadline);
        let mut output =
            OutputRelay::new(self.id, self.request_id.clone(), self.outbox.clone(), deadline);
        let Some(process) = self.process.as_mut() else {
            return Err(RelayError::Launch("sandbox process missing".to_string()));
        };
        let (Some(mut stdout), Some(mut stderr)) = (process.stdout.take(), process.stderr.take())
        else {
            return Err(RelayError::Launch("sandbox output pipes missing".to_string()));
        };

        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let mut stdout_open = true;
        let mut stderr_open = true;

        let ending = loop {
            if !stdout_open && !stderr_open && process.exit.is_some() {
                break Ending::Exited;
            }
            tokio::select! {
                read = stdout.read(&mut out_buf), if stdout_open => {
                    let n = read.map_err(RelayError::Relay)?;
                    let delivery = if n == 0 {
                        stdout_open = false;
                        output.close(StreamKind::Stdout).await
                    } else {
                        output.forward(StreamKind::Stdout, &out_buf[..n]).await
                    };
                    if delivery == Delivery::Closed {
                        break Ending::Disconnected;
                    }
                }
                read = stderr.read(&mut err_buf), if stderr_open => {
                    let n = read.map_err(RelayError::Relay)?;
                    let delivery = if n == 0 {
                        stderr_open = false;
                        output.close(StreamKind::Stderr).await
                    } else {
                        output.forward(StreamKind::Stderr, &err_buf[..n]).await
                    };
                    if delivery == Delivery::Closed {
                        break Ending::Disconnected;
                    }
                }
                status = process.child.wait(), if process.exit.is_none() => {
                    process.exit = Some(status.map_err(RelayError::Relay)?);
                }
                _ = tokio::time::sleep_until(deadline) => break Ending::Deadline,
                _ = state::signalled(abort) => break Ending::Disconnected,
            }
        };

        match ending {
            Ending::Exited => {
                let status = process.exit;
                let launcher = &self.app.launcher;
                if let Some(status) =
                    status.filter(|s| launcher.is_launch_failure(s, output.summary()))
                {
                    return Err(RelayError::Launch(format!(
                        "sandbox runtime could not start the program ({})",
                        status
                    )));
                }
                Ok(SessionState::Completed)
            }
            Ending::Deadline => Ok(self.time_out().await),
            Ending::Disconnected => Ok(self.kill_now().await),
        }
    }

    /// Deadline hit: SIGTERM, tell the caller, SIGKILL after the grace period.
    async fn time_out(&mut self) -> SessionState {
        let grace = self.app.config.grace_period;
        let limit = self.app.config.deadline;
        let notice = ServerMessage::Timeout {
            session: self.id,
            request_id: self.request_id.clone(),
            message: format!(
                "Execution timed out after {:.1} seconds and was terminated.",
                limit.as_secs_f64()
            ),
        };
        warn!(session = %self.id, ?limit, "Deadline exceeded, terminating sandbox");

        self.forced = true;
        let outbox = &self.outbox;
        let Some(process) = self.process.as_mut() else {
            let _ = tokio::time::timeout(grace, outbox.send(notice)).await;
            return SessionState::TimedOut;
        };

        process.signal(Signal::SIGTERM);
        let (_, exited) = tokio::join!(
            tokio::time::timeout(grace, outbox.send(notice)),
            process.wait_for_exit(grace),
        );
        if !exited {
            info!(session = %self.id, "Sandbox ignored SIGTERM, sending SIGKILL");
            process.signal(Signal::SIGKILL);
            process.wait_for_exit(KILL_REAP_TIMEOUT).await;
        }
        SessionState::TimedOut
    }

    /// The connection went away: kill without a grace period.
    async fn kill_now(&mut self) -> SessionState {
        info!(session = %self.id, "Connection closed, killing sandbox");
        self.forced = true;
        if let Some(process) = self.process.as_mut() {
            process.signal(Signal::SIGKILL);
            process.wait_for_exit(KILL_REAP_TIMEOUT).await;
        }
        SessionState::Aborted
    }

    /// Release everything the session owns. Safe to call more than once.
    async fn teardown(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        if let Some(task) = self.stdin_task.take() {
            task.abort();
        }
        if let Some(mut process) = self.process.take() {
            if process.is_alive() {
                self.forced = true;
                process.signal(Signal::SIGKILL);
                process.wait_for_exit(KILL_REAP_TIMEOUT).await;
            }
            // Descendants that outlived the leader.
            process.signal(Signal::SIGKILL);
            if self.forced {
                if let Some(mut cmd) = self.app.launcher.reclaim_command(&self.id.to_string()) {
                    match tokio::time::timeout(KILL_REAP_TIMEOUT, cmd.status()).await {
                        Ok(Ok(_)) => debug!(session = %self.id, "Reclaimed sandbox"),
                        Ok(Err(e)) => warn!(session = %self.id, "Failed to reclaim sandbox: {}", e),
                        Err(_) => warn!(session = %self.id, "Timed out reclaiming sandbox"),
                    }
                }
            }
            self.process = Some(process);
        }
        if let Some(script) = self.script.take() {
            stager::unstage(&script).await;
        }
        self.app.sessions.write().await.remove(&self.id);
    }

    /// Enter the terminal state, clean up, then tell the caller.
    async fn finish(mut self, result: Result<SessionState, RelayError>) {
        let started = self.state == Some(SessionState::Running);
        let (terminal, error) = match result {
            Ok(state) => (state, None),
            Err(err) => (SessionState::Failed, Some(err)),
        };
        self.teardown().await;
        self.state = Some(terminal);

        let exit = self.process.as_ref().and_then(|p| p.exit);
        let code = exit.and_then(|s| s.code());
        let signal = exit.and_then(|s| s.signal());
        info!(
            session = %self.id,
            state = ?terminal,
            code = ?code,
            signal = ?signal,
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            "Session finished"
        );

        if terminal == SessionState::Aborted {
            return;
        }
        if let Some(err) = error {
            warn!(session = %self.id, "Session failed: {}", err);
            let _ = self
                .outbox
                .send(ServerMessage::error(
                    Some(self.id),
                    self.request_id.clone(),
                    &err,
                ))
                .await;
        }
        if started {
            let _ = self
                .outbox
                .send(ServerMessage::Exit {
                    session: self.id,
                    request_id: self.request_id.clone(),
                    state: terminal,
                    code,
                    signal,
                })
                .await;
        }
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        warn!(session = %self.id, "Session dropped before teardown, releasing resources");

        if let Some(task) = self.stdin_task.take() {
            task.abort();
        }
        if let Some(mut process) = self.process.take() {
            process.signal(Signal::SIGKILL);
            let _ = process.child.start_kill();
            if let (Some(mut cmd), Ok(handle)) = (
                self.app.launcher.reclaim_command(&self.id.to_string()),
                tokio::runtime::Handle::try_current(),
            ) {
                handle.spawn(async move {
                    let _ = cmd.status().await;
                });
            }
        }
        if let Some(script) = self.script.take() {
            stager::unstage_blocking(&script);
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sessions = self.app.sessions.clone();
            let id = self.id;
            handle.spawn(async move {
                sessions.write().await.remove(&id);
            });
        }
    }
}
