//! Per-terminal duplex stream
//!
//! Each WebSocket is one viewer. The agent sends `connected`, then every
//! output chunk as `data`, then `exit` before closing. Viewers send `input`
//! and `resize`, which are applied in the order they arrive.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};

use rmx_protocol::{ClientMessage, ServerMessage, TerminalSize};

use crate::error::AgentError;
use crate::session::{ExitInfo, Session, ViewerHandle};
use crate::state::AgentState;

type WsSink = SplitSink<WebSocket, Message>;

pub async fn terminal_stream(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<Arc<AgentState>>,
) -> Result<Response, AgentError> {
    let session = state
        .sessions
        .get(&id)
        .ok_or(AgentError::TerminalNotFound(id))?;
    Ok(ws.on_upgrade(move |socket| run_viewer(socket, session, state)))
}

async fn run_viewer(socket: WebSocket, session: Arc<Session>, state: Arc<AgentState>) {
    let mut viewer = session.attach();
    let terminal_id = session.id().to_string();
    tracing::info!(terminal_id = %terminal_id, viewer_id = viewer.id, "Viewer connected");

    let (mut sink, mut incoming) = socket.split();
    let connected = ServerMessage::Connected {
        terminal_id: terminal_id.clone(),
        pid: session.pid(),
    };

    if send(&mut sink, &connected).await {
        loop {
            tokio::select! {
                // Output first, so everything produced before exit is delivered
                biased;

                chunk = viewer.output.recv() => match chunk {
                    Some(data) => {
                        state.activity.touch();
                        let message = ServerMessage::Data { data: data.to_string() };
                        if !send(&mut sink, &message).await {
                            break;
                        }
                    }
                    None => {
                        let info = viewer.exit.recv().await.unwrap_or_default();
                        finish(&mut sink, &mut viewer, info).await;
                        break;
                    }
                },

                info = viewer.exit.recv() => {
                    finish(&mut sink, &mut viewer, info.unwrap_or_default()).await;
                    break;
                }

                message = incoming.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        state.activity.touch();
                        if !apply(&session, text.as_bytes(), &mut sink).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        state.activity.touch();
                        if !apply(&session, &bytes, &mut sink).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(viewer_id = viewer.id, "Stream error: {}", e);
                        break;
                    }
                },
            }
        }
    }

    session.detach(viewer.id);
    tracing::info!(terminal_id = %terminal_id, viewer_id = viewer.id, "Viewer disconnected");
}

/// Apply one viewer message. Returns false when the stream should end.
async fn apply(session: &Session, frame: &[u8], sink: &mut WsSink) -> bool {
    let result = match ClientMessage::from_bytes(frame) {
        Ok(ClientMessage::Input { data }) => session.write(&data),
        Ok(ClientMessage::Resize { cols, rows }) => session.resize(TerminalSize::new(cols, rows)),
        Err(e) => {
            let message = ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            };
            return send(sink, &message).await;
        }
    };

    if let Err(e) = result {
        // The process is going away; exit arrives through the viewer sinks
        tracing::debug!(terminal_id = %session.id(), "Dropped viewer message: {}", e);
    }
    true
}

/// Drain remaining output, send `exit`, close
async fn finish(sink: &mut WsSink, viewer: &mut ViewerHandle, info: ExitInfo) {
    while let Ok(data) = viewer.output.try_recv() {
        let message = ServerMessage::Data {
            data: data.to_string(),
        };
        if !send(sink, &message).await {
            return;
        }
    }

    let exit = ServerMessage::Exit {
        exit_code: info.exit_code,
        signal: info.signal,
    };
    if send(sink, &exit).await {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: Cow::from("terminal exited"),
            })))
            .await;
    }
}

async fn send(sink: &mut WsSink, message: &ServerMessage) -> bool {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode message: {}", e);
            return false;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}
