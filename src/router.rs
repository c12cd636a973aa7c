//! Per-connection request routing.
//!
//! Each websocket connection gets a reader loop (this module) and a writer
//! task draining the connection's outbox. Every well-formed request becomes
//! an independent session task; the reader never waits on one.

use crate::error::RelayError;
use crate::protocol::{ExecutionRequest, RequestLimits, ServerMessage};
use crate::relay::Outbox;
use crate::session;
use crate::state::{self, AppState};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Messages a connection may have queued before senders wait.
const OUTBOX_CAPACITY: usize = 256;

/// Serve one websocket connection until it closes or the relay stops.
pub async fn serve_connection(socket: WebSocket, app: AppState) {
    let conn = Uuid::new_v4();
    info!(connection = %conn, "Client connected");

    let (mut sink, mut stream) = socket.split();
    let (outbox, mut queue) = mpsc::channel::<ServerMessage>(OUTBOX_CAPACITY);
    let format = app.config.output_format;

    let writer = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            let Some(text) = message.encode(format) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let limits = RequestLimits {
        max_code_bytes: app.config.max_code_bytes,
        max_input_bytes: app.config.max_input_bytes,
    };
    let (abort_tx, abort_rx) = watch::channel(false);
    let mut sessions = JoinSet::new();
    let mut shutdown = app.shutdown.clone();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ExecutionRequest::parse(&text, limits) {
                    Ok(request) => {
                        debug!(connection = %conn, "Received code to execute");
                        sessions.spawn(session::run(
                            app.clone(),
                            request,
                            outbox.clone(),
                            abort_rx.clone(),
                        ));
                    }
                    Err(err) => reject(&outbox, conn, err, &mut shutdown).await,
                },
                Some(Ok(Message::Binary(_))) => {
                    let err = RelayError::Protocol("binary messages are not supported".to_string());
                    reject(&outbox, conn, err, &mut shutdown).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %conn, "Websocket error: {}", e);
                    break;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = state::signalled(&mut shutdown) => {
                info!(connection = %conn, "Relay stopping, closing connection");
                break;
            }
        }
    }

    let live = sessions.len();
    if live > 0 {
        info!(connection = %conn, sessions = live, "Aborting sessions of closed connection");
    }
    let _ = abort_tx.send(true);
    while sessions.join_next().await.is_some() {}

    drop(outbox);
    let _ = writer.await;
    info!(connection = %conn, "Client disconnected");
}

/// Answer a malformed request. Waits for room in the outbox, so a client
/// that stops reading also stops being read from.
async fn reject(
    outbox: &Outbox,
    conn: Uuid,
    err: RelayError,
    shutdown: &mut watch::Receiver<bool>,
) {
    warn!(connection = %conn, "Rejected request: {}", err);
    tokio::select! {
        sent = outbox.send(ServerMessage::error(None, None, &err)) => {
            if sent.is_err() {
                debug!(connection = %conn, "Connection writer gone, error not delivered");
            }
        }
        _ = state::signalled(shutdown) => {}
    }
}
