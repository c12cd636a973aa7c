//! Streaming between a sandbox's pipes and its connection.

use crate::protocol::{ServerMessage, StreamKind};
use std::io::ErrorKind;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bytes read from a sandbox pipe per chunk.
pub const READ_CHUNK: usize = 8192;

/// Sending half of a connection's outgoing message queue.
pub type Outbox = mpsc::Sender<ServerMessage>;

/// Result of handing a message to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The deadline passed while the connection was not draining.
    Late,
    /// Nobody is listening anymore.
    Closed,
}

/// Incremental UTF-8 decoding that never splits a character across two
/// chunks.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode as much of `bytes` as possible, holding back an incomplete
    /// trailing character. Invalid sequences become U+FFFD.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is held back; the stream has ended.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Bytes of stderr kept for classifying how a sandbox ended.
const STDERR_HEAD: usize = 512;

/// What a sandbox wrote, as far as classifying its exit needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSummary {
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    /// Start of stderr, at most a few hundred bytes.
    pub stderr_head: String,
}

impl OutputSummary {
    fn record(&mut self, stream: StreamKind, data: &str) {
        match stream {
            StreamKind::Stdout => self.stdout_bytes += data.len(),
            StreamKind::Stderr => {
                self.stderr_bytes += data.len();
                for c in data.chars() {
                    if self.stderr_head.len() + c.len_utf8() > STDERR_HEAD {
                        break;
                    }
                    self.stderr_head.push(c);
                }
            }
        }
    }
}

/// Forwards one session's stdout and stderr to its connection.
pub struct OutputRelay {
    session: Uuid,
    request_id: Option<String>,
    outbox: Outbox,
    deadline: Instant,
    stdout: Utf8Decoder,
    stderr: Utf8Decoder,
    summary: OutputSummary,
}

impl OutputRelay {
    pub fn new(
        session: Uuid,
        request_id: Option<String>,
        outbox: Outbox,
        deadline: Instant,
    ) -> Self {
        Self {
            session,
            request_id,
            outbox,
            deadline,
            stdout: Utf8Decoder::default(),
            stderr: Utf8Decoder::default(),
            summary: OutputSummary::default(),
        }
    }

    pub fn summary(&self) -> &OutputSummary {
        &self.summary
    }

    fn decoder(&mut self, stream: StreamKind) -> &mut Utf8Decoder {
        match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    /// Forward a chunk read from `stream`.
    pub async fn forward(&mut self, stream: StreamKind, bytes: &[u8]) -> Delivery {
        let data = self.decoder(stream).push(bytes);
        self.send(stream, data).await
    }

    /// `stream` reached end of file.
    pub async fn close(&mut self, stream: StreamKind) -> Delivery {
        let data = self.decoder(stream).finish();
        self.send(stream, data).await
    }

    async fn send(&mut self, stream: StreamKind, data: String) -> Delivery {
        if data.is_empty() {
            return Delivery::Sent;
        }
        self.summary.record(stream, &data);
        debug!(session = %self.session, ?stream, bytes = data.len(), "Forwarding output");
        let message = ServerMessage::Output {
            session: self.session,
            request_id: self.request_id.clone(),
            stream,
            data,
        };
        match tokio::time::timeout_at(self.deadline, self.outbox.send(message)).await {
            Ok(Ok(())) => Delivery::Sent,
            Ok(Err(_)) => Delivery::Closed,
            Err(_) => Delivery::Late,
        }
    }
}

/// Write `inputs` to the sandbox and close its standard input. Without
/// inputs the pipe is closed right away.
pub async fn feed_stdin(session: Uuid, mut stdin: ChildStdin, inputs: Option<String>) {
    if let Some(data) = inputs.filter(|d| !d.is_empty()) {
        let written = async {
            stdin.write_all(data.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        match written {
            Ok(()) => debug!(session = %session, bytes = data.len(), "Delivered inputs"),
            // The program exited or closed stdin without reading everything.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(session = %session, "Sandbox closed stdin early")
            }
            Err(e) => warn!(session = %session, "Failed to write inputs: {}", e),
        }
    }
    drop(stdin);
}
