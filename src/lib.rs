//! coderelay - runs submitted code in throwaway sandboxes and streams the
//! output back over a websocket.
//!
//! A [`Relay`] accepts connections; every request on a connection becomes a
//! session that stages the code to a scratch file, launches a sandbox with
//! fixed resource ceilings, relays its standard streams and reclaims both
//! the file and the process however the run ends.

#[cfg(not(target_os = "linux"))]
compile_error!("coderelay only works on Linux.");

pub mod config;
pub mod error;
pub mod http_server;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod sandbox;
pub mod session;
pub mod stager;
pub mod state;

pub use config::{RelayConfig, SandboxConfig};
pub use error::{ErrorKind, RelayError, Result};
pub use http_server::{Relay, RelayHandle};
pub use protocol::{ExecutionRequest, OutputFormat, ServerMessage, StreamKind};
pub use relay::OutputSummary;
pub use sandbox::{ContainerLauncher, LaunchSpec, Launcher};
pub use stager::{DirUploadStore, Stager, UploadStore};
pub use state::SessionState;
