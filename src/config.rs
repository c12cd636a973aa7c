//! Relay and sandbox configuration.

use crate::protocol::OutputFormat;
use std::time::Duration;

/// Per-instance relay tunables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Wall-clock budget of a sandbox, measured from launch.
    pub deadline: Duration,
    /// Time between SIGTERM and SIGKILL once the deadline is hit.
    pub grace_period: Duration,
    /// Maximum number of sandboxes running at once.
    pub max_concurrent: usize,
    /// How long a request may wait for a free sandbox slot.
    pub admission_wait: Duration,
    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
    pub output_format: OutputFormat,
}

impl RelayConfig {
    /// Largest websocket message a client may send.
    pub fn max_message_bytes(&self) -> usize {
        // Room for JSON escaping of both fields plus the envelope.
        (self.max_code_bytes + self.max_input_bytes) * 2 + 4096
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(10),
            grace_period: Duration::from_secs(2),
            max_concurrent: 8,
            admission_wait: Duration::from_secs(5),
            max_code_bytes: 64 * 1024,
            max_input_bytes: 1024 * 1024,
            output_format: OutputFormat::Tagged,
        }
    }
}

/// How the container launcher builds a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container runtime client binary.
    pub runtime: String,
    pub image: String,
    /// Interpreter command; the in-sandbox script path is appended.
    pub interpreter: Vec<String>,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u64,
    /// Where the staged script appears inside the sandbox.
    pub script_path: String,
    /// Where the caller's upload directory appears inside the sandbox.
    pub data_path: String,
    /// Working directory when no data directory is mounted.
    pub fallback_workdir: String,
    pub tmpfs_size_mb: u64,
    pub container_prefix: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "python-runner".to_string(),
            interpreter: vec!["python".to_string()],
            memory_mb: 256,
            cpus: 0.5,
            pids_limit: 64,
            script_path: "/app/script.py".to_string(),
            data_path: "/data".to_string(),
            fallback_workdir: "/tmp".to_string(),
            tmpfs_size_mb: 16,
            container_prefix: "coderelay".to_string(),
        }
    }
}
