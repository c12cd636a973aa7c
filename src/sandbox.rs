//! Sandbox launching and process-group signalling.

use crate::config::SandboxConfig;
use crate::error::{RelayError, Result};
use crate::relay::OutputSummary;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

/// Exit status a container runtime uses for its own start failures.
const RUNTIME_START_FAILURE: i32 = 125;

/// What to start.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    /// Unique per execution; used to name the sandbox.
    pub name: &'a str,
    /// Host path of the staged script.
    pub script: &'a Path,
    /// Host path of the caller's data directory.
    pub mount: Option<&'a Path>,
}

/// Builds the command that runs a staged script in isolation.
///
/// [`launch`] takes care of stdio, process groups and spawning; a launcher
/// only decides what gets executed.
pub trait Launcher: Send + Sync {
    fn command(&self, spec: &LaunchSpec<'_>) -> Command;

    /// Command that releases whatever the sandbox left behind after its
    /// client process was killed.
    fn reclaim_command(&self, _name: &str) -> Option<Command> {
        None
    }

    /// Whether the sandbox ended with `status` and `output` because it
    /// never started the program, rather than because the program exited.
    fn is_launch_failure(&self, _status: &ExitStatus, _output: &OutputSummary) -> bool {
        false
    }
}

/// Runs scripts in throwaway containers through a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct ContainerLauncher {
    config: SandboxConfig,
}

impl ContainerLauncher {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Prefix the runtime puts on its own error messages, e.g. `docker:`.
    fn runtime_prefix(&self) -> String {
        let name = Path::new(&self.config.runtime)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(self.config.runtime.as_str());
        format!("{}:", name)
    }

    fn container_name(&self, name: &str) -> String {
        format!("{}-{}", self.config.container_prefix, name)
    }

    /// Arguments passed to the runtime for `spec`.
    pub fn args(&self, spec: &LaunchSpec<'_>) -> Vec<String> {
        let c = &self.config;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            self.container_name(spec.name),
            "--pull".to_string(),
            "never".to_string(),
            "--network".to_string(),
            "none".to_string(),
            format!("--memory={}m", c.memory_mb),
            format!("--memory-swap={}m", c.memory_mb),
            format!("--cpus={}", c.cpus),
            format!("--pids-limit={}", c.pids_limit),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            format!("/tmp:rw,nosuid,nodev,size={}m", c.tmpfs_size_mb),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
        ];

        let workdir = match spec.mount {
            Some(_) => &c.data_path,
            None => &c.fallback_workdir,
        };
        args.extend(["--workdir".to_string(), workdir.clone()]);

        args.push("--mount".to_string());
        args.push(format!(
            "type=bind,source={},target={},readonly",
            spec.script.display(),
            c.script_path
        ));
        if let Some(mount) = spec.mount {
            args.push("--mount".to_string());
            args.push(format!(
                "type=bind,source={},target={},readonly",
                mount.display(),
                c.data_path
            ));
        }

        args.push(c.image.clone());
        args.extend(c.interpreter.iter().cloned());
        args.push(c.script_path.clone());
        args
    }

    /// Check that the runtime answers and the image is present locally.
    pub async fn verify(&self) -> Result<()> {
        let output = Command::new(&self.config.runtime)
            .args(["image", "inspect", "--format", "{{.Id}}", &self.config.image])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RelayError::Launch(format!("{}: {}", self.config.runtime, e)))?;
        if !output.status.success() {
            return Err(RelayError::Launch(format!(
                "image {} is not available: {}",
                self.config.image,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl Launcher for ContainerLauncher {
    fn command(&self, spec: &LaunchSpec<'_>) -> Command {
        let mut cmd = Command::new(&self.config.runtime);
        cmd.args(self.args(spec));
        cmd
    }

    fn reclaim_command(&self, name: &str) -> Option<Command> {
        let mut cmd = Command::new(&self.config.runtime);
        cmd.args(["rm", "-f", &self.container_name(name)])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Some(cmd)
    }

    /// The runtime exits 125 for its own failures, but so does a program
    /// calling `exit(125)`. Only a run that printed nothing but the runtime's
    /// own complaint counts as a failed start.
    fn is_launch_failure(&self, status: &ExitStatus, output: &OutputSummary) -> bool {
        status.code() == Some(RUNTIME_START_FAILURE)
            && output.stdout_bytes == 0
            && output
                .stderr_head
                .trim_start()
                .starts_with(&self.runtime_prefix())
    }
}

/// A started sandbox. The process leads its own process group.
#[derive(Debug)]
pub struct SandboxProcess {
    pub child: Child,
    pub pgid: i32,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    pub exit: Option<ExitStatus>,
}

/// Start the sandbox described by `spec`.
pub fn launch(launcher: &dyn Launcher, spec: &LaunchSpec<'_>) -> Result<SandboxProcess> {
    let mut cmd = launcher.command(spec);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound => RelayError::Launch(format!("sandbox runtime not found: {}", e)),
        _ => RelayError::Launch(e.to_string()),
    })?;

    let pgid = child
        .id()
        .ok_or_else(|| RelayError::Launch("sandbox exited before it was supervised".to_string()))?
        as i32;
    let stdin = child.stdin.take();
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(RelayError::Launch("sandbox output pipes unavailable".to_string()));
    };

    info!(name = spec.name, pid = pgid, mount = ?spec.mount, "Sandbox launched");
    Ok(SandboxProcess {
        child,
        pgid,
        stdin,
        stdout: Some(stdout),
        stderr: Some(stderr),
        exit: None,
    })
}

impl SandboxProcess {
    /// Signal every process in the sandbox's group. Returns `false` once the
    /// group is gone.
    pub fn signal(&self, signal: Signal) -> bool {
        signal_group(self.pgid, signal)
    }

    /// Wait up to `limit` for the sandbox to exit, reaping it.
    pub async fn wait_for_exit(&mut self, limit: Duration) -> bool {
        if self.exit.is_some() {
            return true;
        }
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit = Some(status);
                true
            }
            Ok(Err(e)) => {
                warn!(pid = self.pgid, "wait failed: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }
}

/// Send `signal` to process group `pgid`.
pub fn signal_group(pgid: i32, signal: Signal) -> bool {
    if pgid <= 1 {
        return false;
    }
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, ?signal, "killpg failed: {}", e);
            false
        }
    }
}
