//! Wire format of the execution protocol.
//!
//! Clients send one JSON object per execution:
//!
//! ```json
//! { "code": "print(input())", "inputs": "Alice\n", "userId": "u1", "requestId": "cell-3" }
//! ```
//!
//! The server answers with [`ServerMessage`]s, either as tagged JSON or, in
//! raw mode, as bare text that can be appended straight to a terminal.

use crate::error::{ErrorKind, RelayError};
use crate::state::SessionState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single execution request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub code: String,
    /// Written to the program's standard input, which is then closed.
    #[serde(default)]
    pub inputs: Option<String>,
    /// Opaque caller identity, only used to pick the data mount.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Echoed back on every tagged message of the execution.
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Size ceilings applied while parsing requests.
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
}

impl ExecutionRequest {
    pub fn parse(text: &str, limits: RequestLimits) -> Result<Self, RelayError> {
        let request: ExecutionRequest =
            serde_json::from_str(text).map_err(|e| RelayError::Protocol(e.to_string()))?;

        if request.code.len() > limits.max_code_bytes {
            return Err(RelayError::Protocol(format!(
                "code is {} bytes, limit is {}",
                request.code.len(),
                limits.max_code_bytes
            )));
        }
        if let Some(inputs) = &request.inputs {
            if inputs.len() > limits.max_input_bytes {
                return Err(RelayError::Protocol(format!(
                    "inputs are {} bytes, limit is {}",
                    inputs.len(),
                    limits.max_input_bytes
                )));
            }
        }
        Ok(request)
    }
}

/// Which sandbox pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// How server messages are put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per message, attributed to its session.
    #[default]
    Tagged,
    /// Output and notices as plain text; no lifecycle messages.
    Raw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Started {
        session: Uuid,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Output {
        session: Uuid,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        stream: StreamKind,
        data: String,
    },
    Timeout {
        session: Uuid,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<Uuid>,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        kind: ErrorKind,
        message: String,
    },
    Exit {
        session: Uuid,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        state: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
}

impl ServerMessage {
    pub fn error(session: Option<Uuid>, request_id: Option<String>, err: &RelayError) -> Self {
        ServerMessage::Error {
            session,
            request_id,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Render for the wire. `None` means the message has no form in this
    /// format and is skipped.
    pub fn encode(&self, format: OutputFormat) -> Option<String> {
        match format {
            OutputFormat::Tagged => match serde_json::to_string(self) {
                Ok(json) => Some(json),
                Err(e) => {
                    tracing::warn!("failed to encode server message: {}", e);
                    None
                }
            },
            OutputFormat::Raw => match self {
                ServerMessage::Output { data, .. } => Some(data.clone()),
                ServerMessage::Timeout { message, .. } => Some(format!("\n{}\n", message)),
                ServerMessage::Error { message, .. } => Some(format!("Error: {}\n", message)),
                ServerMessage::Started { .. } | ServerMessage::Exit { .. } => None,
            },
        }
    }

    /// Session the message belongs to, if any.
    pub fn session(&self) -> Option<Uuid> {
        match self {
            ServerMessage::Started { session, .. }
            | ServerMessage::Output { session, .. }
            | ServerMessage::Timeout { session, .. }
            | ServerMessage::Exit { session, .. } => Some(*session),
            ServerMessage::Error { session, .. } => *session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: RequestLimits = RequestLimits {
        max_code_bytes: 32,
        max_input_bytes: 8,
    };

    #[test]
    fn parses_camel_case_fields() {
        let req = ExecutionRequest::parse(
            r#"{"code":"print(1)","inputs":"a\n","userId":"u1","requestId":"cell-1"}"#,
            LIMITS,
        )
        .unwrap();
        assert_eq!(req.code, "print(1)");
        assert_eq!(req.inputs.as_deref(), Some("a\n"));
        assert_eq!(req.user_id.as_deref(), Some("u1"));
        assert_eq!(req.request_id.as_deref(), Some("cell-1"));
    }

    #[test]
    fn optional_fields_may_be_null_or_missing() {
        let req = ExecutionRequest::parse(r#"{"code":"x","inputs":null}"#, LIMITS).unwrap();
        assert!(req.inputs.is_none());
        assert!(req.user_id.is_none());
    }

    #[test]
    fn rejects_missing_or_mistyped_code() {
        for text in [r#"{}"#, r#"{"code":42}"#, r#"{"inputs":"x"}"#, "not json", "[]"] {
            let err = ExecutionRequest::parse(text, LIMITS).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Protocol, "{text}");
        }
    }

    #[test]
    fn rejects_oversized_fields() {
        let code = "x".repeat(33);
        let err = ExecutionRequest::parse(&format!(r#"{{"code":"{code}"}}"#), LIMITS).unwrap_err();
        assert!(err.to_string().contains("limit is 32"));

        let err =
            ExecutionRequest::parse(r#"{"code":"x","inputs":"123456789"}"#, LIMITS).unwrap_err();
        assert!(err.to_string().contains("limit is 8"));
    }

    #[test]
    fn tagged_output_names_its_session() {
        let session = Uuid::new_v4();
        let msg = ServerMessage::Output {
            session,
            request_id: None,
            stream: StreamKind::Stderr,
            data: "boom\n".into(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&msg.encode(OutputFormat::Tagged).unwrap()).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["stream"], "stderr");
        assert_eq!(json["session"], session.to_string());
        assert!(json.get("requestId").is_none());
    }

    #[test]
    fn raw_mode_drops_lifecycle_messages() {
        let session = Uuid::new_v4();
        let started = ServerMessage::Started {
            session,
            request_id: None,
        };
        let exit = ServerMessage::Exit {
            session,
            request_id: None,
            state: SessionState::Completed,
            code: Some(0),
            signal: None,
        };
        assert_eq!(started.encode(OutputFormat::Raw), None);
        assert_eq!(exit.encode(OutputFormat::Raw), None);

        let output = ServerMessage::Output {
            session,
            request_id: None,
            stream: StreamKind::Stdout,
            data: "hi\n".into(),
        };
        assert_eq!(output.encode(OutputFormat::Raw).as_deref(), Some("hi\n"));
    }

    #[test]
    fn exit_round_trips_through_json() {
        let msg = ServerMessage::Exit {
            session: Uuid::new_v4(),
            request_id: Some("r".into()),
            state: SessionState::TimedOut,
            code: None,
            signal: Some(9),
        };
        let text = msg.encode(OutputFormat::Tagged).unwrap();
        assert!(text.contains(r#""state":"timed_out""#));
        let back: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }
}
