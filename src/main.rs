//! coderelay - sandboxed code execution relay.
//!
//! Usage:
//!   coderelay serve [--port 8080]                 # Start the websocket relay
//!   coderelay run script.py [--inputs "..."]      # Run one script and print its output

use clap::{Args, Parser, Subcommand};
use coderelay::protocol::OutputFormat;
use coderelay::{
    ContainerLauncher, DirUploadStore, ExecutionRequest, Relay, RelayConfig, SandboxConfig,
    ServerMessage, SessionState, Stager, StreamKind,
};
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "coderelay")]
#[command(about = "Sandboxed code execution relay with websocket streaming")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the websocket relay
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,

        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Maximum number of sandboxes running at once
        #[arg(long, default_value = "8")]
        max_concurrent: usize,

        /// How long a request may wait for a free sandbox, in milliseconds
        #[arg(long, default_value = "5000")]
        admission_wait_ms: u64,

        /// Wire format of server messages
        #[arg(long, value_enum, default_value = "tagged")]
        output: OutputFormat,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
    /// Run a single script through the sandbox and print its output
    Run {
        /// Script to run
        script: PathBuf,

        /// Data written to the program's standard input
        #[arg(long)]
        inputs: Option<String>,

        /// Identity whose upload directory is mounted
        #[arg(long)]
        user_id: Option<String>,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
}

#[derive(Args, Debug)]
struct SandboxArgs {
    /// Container runtime binary
    #[arg(long, default_value = "docker")]
    runtime: String,

    /// Sandbox image
    #[arg(long, default_value = "python-runner")]
    image: String,

    /// Memory ceiling in MiB
    #[arg(long, default_value = "256")]
    memory_mb: u64,

    /// CPU ceiling in cores
    #[arg(long, default_value = "0.5")]
    cpus: f64,

    /// Maximum number of processes inside a sandbox
    #[arg(long, default_value = "64")]
    pids_limit: u64,

    /// Wall-clock limit per execution in milliseconds
    #[arg(long, default_value = "10000")]
    deadline_ms: u64,

    /// Time between SIGTERM and SIGKILL after the deadline, in milliseconds
    #[arg(long, default_value = "2000")]
    grace_ms: u64,

    /// Root for staged scripts; each relay stages into its own subdirectory
    #[arg(long, default_value = "temp")]
    scratch_dir: PathBuf,

    /// Root of per-user upload directories
    #[arg(long, default_value = "uploads")]
    uploads_dir: PathBuf,

    /// Never attach upload directories to sandboxes
    #[arg(long)]
    no_mounts: bool,

    /// Extension of staged script files
    #[arg(long, default_value = "py")]
    extension: String,
}

impl SandboxArgs {
    fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            runtime: self.runtime.clone(),
            image: self.image.clone(),
            memory_mb: self.memory_mb,
            cpus: self.cpus,
            pids_limit: self.pids_limit,
            ..SandboxConfig::default()
        }
    }

    fn stager(&self) -> coderelay::Result<Stager> {
        let stager = Stager::open(&self.scratch_dir, &self.extension)?;
        if self.no_mounts {
            return Ok(stager);
        }
        match DirUploadStore::open(&self.uploads_dir) {
            Ok(store) => Ok(stager.with_upload_store(Arc::new(store))),
            Err(e) => {
                warn!(
                    dir = ?self.uploads_dir,
                    "Upload directory unavailable, running without mounts: {}", e
                );
                Ok(stager)
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            max_concurrent,
            admission_wait_ms,
            output,
            sandbox,
        } => {
            let config = RelayConfig {
                deadline: Duration::from_millis(sandbox.deadline_ms),
                grace_period: Duration::from_millis(sandbox.grace_ms),
                max_concurrent,
                admission_wait: Duration::from_millis(admission_wait_ms),
                output_format: output,
                ..RelayConfig::default()
            };
            if let Err(e) = serve(SocketAddr::new(host, port), config, &sandbox).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Run {
            script,
            inputs,
            user_id,
            sandbox,
        } => match run_once(script, inputs, user_id, &sandbox).await {
            Ok(code) => exit(code),
            Err(e) => {
                eprintln!("Error: {}", e);
                exit(1);
            }
        },
    }
}

async fn serve(addr: SocketAddr, config: RelayConfig, args: &SandboxArgs) -> coderelay::Result<()> {
    let stager = args.stager()?;
    let launcher = ContainerLauncher::new(args.sandbox_config());
    if let Err(e) = launcher.verify().await {
        warn!("Sandbox runtime check failed, executions will fail until fixed: {}", e);
    }

    let handle = Relay::new(config, stager, Arc::new(launcher)).start(addr).await?;
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    handle.stop().await
}

/// Exit status mirroring the program's, `124` on timeout.
async fn run_once(
    script: PathBuf,
    inputs: Option<String>,
    user_id: Option<String>,
    args: &SandboxArgs,
) -> coderelay::Result<i32> {
    let code = tokio::fs::read_to_string(&script).await?;
    let config = RelayConfig {
        deadline: Duration::from_millis(args.deadline_ms),
        grace_period: Duration::from_millis(args.grace_ms),
        max_concurrent: 1,
        max_code_bytes: code.len().max(1),
        ..RelayConfig::default()
    };
    let launcher = ContainerLauncher::new(args.sandbox_config());
    let relay = Relay::new(config, args.stager()?, Arc::new(launcher));

    let (tx, mut rx) = mpsc::channel(64);
    let request = ExecutionRequest {
        code,
        inputs,
        user_id,
        request_id: None,
    };
    let execution = relay.execute(request, tx);
    let printer = async {
        let mut status = 1;
        while let Some(message) = rx.recv().await {
            match message {
                ServerMessage::Output { stream, data, .. } => match stream {
                    StreamKind::Stdout => {
                        print!("{}", data);
                        let _ = std::io::stdout().flush();
                    }
                    StreamKind::Stderr => eprint!("{}", data),
                },
                ServerMessage::Timeout { message, .. } => eprintln!("{}", message),
                ServerMessage::Error { message, .. } => eprintln!("Error: {}", message),
                ServerMessage::Exit {
                    state, code, signal, ..
                } => {
                    status = match state {
                        SessionState::TimedOut => 124,
                        _ => code.unwrap_or(128 + signal.unwrap_or(0)),
                    };
                }
                ServerMessage::Started { .. } => {}
            }
        }
        status
    };
    let ((), status) = tokio::join!(execution, printer);
    Ok(status)
}
