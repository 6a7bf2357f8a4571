//! Interactive shell over a session channel (direct-shell terminals)

use bytes::Bytes;
use russh::ChannelMsg;
use tokio::sync::mpsc;

use rmx_core::ConnectError;
use rmx_protocol::TerminalSize;

use super::ssh::SshSession;

/// Output chunks buffered from the channel
const SHELL_EVENT_QUEUE: usize = 256;

/// Something the remote shell produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Data(Bytes),
    /// Channel closed; exit status if the server sent one
    Exit(Option<u32>),
}

enum ShellCommand {
    Data(Vec<u8>),
    Resize(TerminalSize),
    Close,
}

/// A PTY shell running in its own channel of the SSH session
pub struct ShellChannel {
    writer: ShellWriter,
    events: mpsc::Receiver<ShellEvent>,
}

impl ShellChannel {
    /// Request a PTY and a shell, then drive the channel from a task
    pub(super) async fn open(session: &SshSession, size: TerminalSize) -> Result<Self, ConnectError> {
        let size = size.sanitized();
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ConnectError::Channel(format!("open session: {}", e)))?;
        channel
            .request_pty(
                true,
                "xterm-256color",
                size.cols as u32,
                size.rows as u32,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| ConnectError::Channel(format!("request pty: {}", e)))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| ConnectError::Channel(format!("request shell: {}", e)))?;

        let (command_tx, mut commands) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::channel(SHELL_EVENT_QUEUE);

        tokio::spawn(async move {
            let mut exit_status = None;
            loop {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(ShellCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                tracing::debug!("Shell write failed: {}", e);
                                break;
                            }
                        }
                        Some(ShellCommand::Resize(size)) => {
                            let size = size.sanitized();
                            if let Err(e) = channel
                                .window_change(size.cols as u32, size.rows as u32, 0, 0)
                                .await
                            {
                                tracing::debug!("Shell resize failed: {}", e);
                            }
                        }
                        Some(ShellCommand::Close) | None => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    },
                    message = channel.wait() => match message {
                        Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                            if event_tx.send(ShellEvent::Data(Bytes::copy_from_slice(&data))).await.is_err() {
                                let _ = channel.close().await;
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: status }) => exit_status = Some(status),
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                }
            }
            let _ = event_tx.send(ShellEvent::Exit(exit_status)).await;
        });

        Ok(Self {
            writer: ShellWriter {
                commands: command_tx,
            },
            events,
        })
    }

    /// Write handle (keystrokes, resize, close)
    pub fn writer(&self) -> &ShellWriter {
        &self.writer
    }

    /// Next output or exit; `None` once the channel task has ended
    pub async fn recv(&mut self) -> Option<ShellEvent> {
        self.events.recv().await
    }

    /// Split into a write handle and the event stream
    pub fn split(self) -> (ShellWriter, mpsc::Receiver<ShellEvent>) {
        (self.writer, self.events)
    }
}

/// Write side of a [`ShellChannel`]
#[derive(Clone)]
pub struct ShellWriter {
    commands: mpsc::UnboundedSender<ShellCommand>,
}

impl ShellWriter {
    /// Send keystrokes
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), ConnectError> {
        self.commands
            .send(ShellCommand::Data(data.into()))
            .map_err(|_| ConnectError::Channel("shell closed".to_string()))
    }

    /// Change the remote PTY size
    pub fn resize(&self, size: TerminalSize) -> Result<(), ConnectError> {
        self.commands
            .send(ShellCommand::Resize(size))
            .map_err(|_| ConnectError::Channel("shell closed".to_string()))
    }

    /// Send EOF and close the channel
    pub fn close(&self) {
        let _ = self.commands.send(ShellCommand::Close);
    }
}
