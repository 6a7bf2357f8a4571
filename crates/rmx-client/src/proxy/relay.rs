use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{ProxyEvent, ABNORMAL_CLOSURE};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(super) enum RelayCommand {
    Send(String),
    Close { code: u16, reason: String },
}

/// Handle to one running relay task
pub(super) struct Relay {
    commands: mpsc::UnboundedSender<RelayCommand>,
    task: JoinHandle<()>,
}

impl Relay {
    pub(super) fn send(&self, command: RelayCommand) -> Result<(), RelayCommand> {
        self.commands.send(command).map_err(|e| e.0)
    }

    pub(super) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub(super) fn spawn(
    connection_id: String,
    socket: Socket,
    events: mpsc::UnboundedSender<ProxyEvent>,
) -> Relay {
    let (commands, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(connection_id, socket, rx, events));
    Relay { commands, task }
}

async fn run(
    connection_id: String,
    mut socket: Socket,
    mut commands: mpsc::UnboundedReceiver<RelayCommand>,
    events: mpsc::UnboundedSender<ProxyEvent>,
) {
    let emit = |event: ProxyEvent| {
        let _ = events.send(event);
    };
    // Set once we initiated the close handshake
    let mut closing: Option<(u16, String)> = None;

    let (code, reason) = loop {
        tokio::select! {
            command = commands.recv(), if closing.is_none() => match command {
                Some(RelayCommand::Send(data)) => {
                    if let Err(e) = socket.send(Message::Text(data)).await {
                        tracing::warn!(connection_id = %connection_id, "Proxy send failed: {}", e);
                        emit(ProxyEvent::Error {
                            connection_id: Some(connection_id.clone()),
                            request_id: None,
                            message: e.to_string(),
                        });
                        break (ABNORMAL_CLOSURE, e.to_string());
                    }
                }
                Some(RelayCommand::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    if socket.close(Some(frame)).await.is_err() {
                        break (code, reason);
                    }
                    closing = Some((code, reason));
                }
                // Proxy dropped the handle
                None => {
                    let _ = socket.close(None).await;
                    closing = Some((ABNORMAL_CLOSURE, String::new()));
                }
            },

            frame = socket.next() => match frame {
                Some(Ok(Message::Text(data))) => {
                    emit(ProxyEvent::Message { connection_id: connection_id.clone(), data });
                }
                Some(Ok(Message::Binary(bytes))) => {
                    emit(ProxyEvent::Message {
                        connection_id: connection_id.clone(),
                        data: String::from_utf8_lossy(&bytes).into_owned(),
                    });
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                        None => closing.clone().unwrap_or((1005, String::new())),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if let Some(ours) = closing.clone() {
                        break ours;
                    }
                    tracing::warn!(connection_id = %connection_id, "Proxy connection failed: {}", e);
                    emit(ProxyEvent::Error {
                        connection_id: Some(connection_id.clone()),
                        request_id: None,
                        message: e.to_string(),
                    });
                    break (ABNORMAL_CLOSURE, e.to_string());
                }
                None => break closing.clone().unwrap_or((ABNORMAL_CLOSURE, String::new())),
            },
        }
    };

    tracing::debug!(connection_id = %connection_id, code, "Proxy connection closed");
    emit(ProxyEvent::Closed {
        connection_id,
        code,
        reason,
    });
}
