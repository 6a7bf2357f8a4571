//! The three ways a terminal reaches a shell

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use rmx_agent::session::{ExitInfo, Session, SessionManager, ViewerHandle};
use rmx_protocol::{ClientMessage, ServerMessage, TerminalSize, Utf8Decoder};

use super::TerminalEvent;
use crate::agent_client::AgentClient;
use crate::connection::{ShellEvent, ShellWriter};
use crate::error::TerminalError;

/// Bound on the stream handshake with the agent
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) enum AgentInput {
    Message(ClientMessage),
    Close,
}

/// Write side of a terminal, one variant per routing mode
pub(super) enum Backend {
    Agent(mpsc::UnboundedSender<AgentInput>),
    DirectShell(ShellWriter),
    Local {
        sessions: Arc<SessionManager>,
        session: Arc<Session>,
    },
}

impl Backend {
    pub(super) fn write(&self, data: &str) -> Result<(), TerminalError> {
        match self {
            Backend::Agent(input) => input
                .send(AgentInput::Message(ClientMessage::Input {
                    data: data.to_string(),
                }))
                .map_err(|_| TerminalError::Closed),
            Backend::DirectShell(writer) => Ok(writer.write(data.as_bytes().to_vec())?),
            Backend::Local { session, .. } => session
                .write(data)
                .map_err(|e| TerminalError::Local(e.to_string())),
        }
    }

    pub(super) fn resize(&self, size: TerminalSize) -> Result<(), TerminalError> {
        let size = size.sanitized();
        match self {
            Backend::Agent(input) => input
                .send(AgentInput::Message(ClientMessage::Resize {
                    cols: size.cols,
                    rows: size.rows,
                }))
                .map_err(|_| TerminalError::Closed),
            Backend::DirectShell(writer) => Ok(writer.resize(size)?),
            Backend::Local { session, .. } => session
                .resize(size)
                .map_err(|e| TerminalError::Local(e.to_string())),
        }
    }

    /// Agent: detach only, the remote session lives on.
    /// Direct shell and local: the process goes with the terminal.
    pub(super) fn close(&self) {
        match self {
            Backend::Agent(input) => {
                let _ = input.send(AgentInput::Close);
            }
            Backend::DirectShell(writer) => {
                let _ = writer.close();
            }
            Backend::Local { sessions, session } => {
                if let Err(e) = sessions.delete(session.id()) {
                    tracing::debug!(terminal_id = %session.id(), "Local terminal already gone: {}", e);
                }
            }
        }
    }
}

fn exit_event(info: ExitInfo) -> TerminalEvent {
    TerminalEvent::Exit {
        exit_code: info.exit_code,
        signal: info.signal,
    }
}

/// Attach to an agent terminal's stream endpoint
pub(super) async fn connect_agent(
    client: &AgentClient,
    terminal_id: &str,
    events: mpsc::UnboundedSender<TerminalEvent>,
) -> Result<Backend, TerminalError> {
    let url = client.stream_url(terminal_id);
    let (socket, _) = tokio::time::timeout(
        STREAM_CONNECT_TIMEOUT,
        tokio_tungstenite::connect_async(url.as_str()),
    )
    .await
    .map_err(|_| TerminalError::Timeout(STREAM_CONNECT_TIMEOUT))?
    .map_err(|e| TerminalError::Agent(format!("stream {}: {}", url, e)))?;

    let (input_tx, mut input) = mpsc::unbounded_channel();
    let (mut sink, mut stream) = socket.split();
    let terminal_id = terminal_id.to_string();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                command = input.recv() => match command {
                    Some(AgentInput::Message(message)) => {
                        let text = match message.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!(terminal_id = %terminal_id, "Unencodable message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            let _ = events.send(TerminalEvent::Error(format!("send failed: {}", e)));
                            break;
                        }
                    }
                    Some(AgentInput::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        tracing::debug!(terminal_id = %terminal_id, "Detached from agent terminal");
                        break;
                    }
                },

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                        Ok(ServerMessage::Connected { pid, .. }) => {
                            tracing::debug!(terminal_id = %terminal_id, pid, "Stream attached");
                        }
                        Ok(ServerMessage::Data { data }) => {
                            let _ = events.send(TerminalEvent::Output(data));
                        }
                        Ok(ServerMessage::Exit { exit_code, signal }) => {
                            let _ = events.send(TerminalEvent::Exit { exit_code, signal });
                            break;
                        }
                        Ok(ServerMessage::Error { message }) => {
                            let _ = events.send(TerminalEvent::Error(message));
                        }
                        Err(e) => {
                            tracing::warn!(terminal_id = %terminal_id, "Bad frame from agent: {}", e);
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events.send(TerminalEvent::Error("stream closed".to_string()));
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(TerminalEvent::Error(format!("stream failed: {}", e)));
                        break;
                    }
                },
            }
        }
    });

    Ok(Backend::Agent(input_tx))
}

/// Drive a shell channel opened on the SSH session itself
pub(super) fn direct_shell(
    writer: ShellWriter,
    mut shell_events: mpsc::Receiver<ShellEvent>,
    events: mpsc::UnboundedSender<TerminalEvent>,
) -> Backend {
    tokio::spawn(async move {
        let mut decoder = Utf8Decoder::new();
        let mut exit_code = None;
        while let Some(event) = shell_events.recv().await {
            match event {
                ShellEvent::Data(bytes) => {
                    let text = decoder.push(&bytes);
                    if !text.is_empty() {
                        let _ = events.send(TerminalEvent::Output(text));
                    }
                }
                ShellEvent::Exit(status) => {
                    exit_code = status.map(|s| s as i32);
                    break;
                }
            }
        }
        let tail = decoder.finish();
        if !tail.is_empty() {
            let _ = events.send(TerminalEvent::Output(tail));
        }
        let _ = events.send(TerminalEvent::Exit {
            exit_code,
            signal: None,
        });
    });
    Backend::DirectShell(writer)
}

/// Watch a session owned by the in-process session manager
pub(super) fn local(
    sessions: Arc<SessionManager>,
    session: Arc<Session>,
    mut viewer: ViewerHandle,
    events: mpsc::UnboundedSender<TerminalEvent>,
) -> Backend {
    tokio::spawn(async move {
        let info = loop {
            tokio::select! {
                biased;
                chunk = viewer.output.recv() => match chunk {
                    Some(chunk) => {
                        let _ = events.send(TerminalEvent::Output(chunk.to_string()));
                    }
                    None => break viewer.exit.recv().await.unwrap_or_default(),
                },
                info = viewer.exit.recv() => {
                    while let Ok(chunk) = viewer.output.try_recv() {
                        let _ = events.send(TerminalEvent::Output(chunk.to_string()));
                    }
                    break info.unwrap_or_default();
                }
            }
        };
        let _ = events.send(exit_event(info));
    });
    Backend::Local { sessions, session }
}
