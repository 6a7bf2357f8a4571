//! Localhost JSON-lines front for the transport proxy
//!
//! One request per line in, one event per line out. Each IPC client gets
//! its own [`TransportProxy`]; its connections close when the client goes away.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{OpenRequest, ProxyEvent, TransportProxy};

/// Requests accepted from IPC clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyRequest {
    Open(OpenRequest),
    #[serde(rename_all = "camelCase")]
    Send { connection_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    Close {
        connection_id: String,
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },
}

/// IPC server for the transport proxy
///
/// Listens on localhost (127.0.0.1) only.
pub struct ProxyIpcServer {
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl ProxyIpcServer {
    /// Bind to `127.0.0.1:port` (0 for an ephemeral port)
    pub async fn bind(port: u16) -> Result<Self> {
        let address = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind proxy IPC server to {}", address))?;
        Ok(Self {
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancel to stop accepting and close every client
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("Proxy IPC server listening on {}", self.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    if !peer_addr.ip().is_loopback() {
                        tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                        continue;
                    }
                    let token = self.shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, token).await {
                            tracing::warn!("Proxy IPC client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept proxy IPC connection: {}", e);
                }
            }
        }

        tracing::info!("Proxy IPC server stopped");
        Ok(())
    }
}

async fn write_event<W: AsyncWrite + Unpin>(writer: &mut W, event: &ProxyEvent) -> Result<()> {
    let mut json = serde_json::to_string(event)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}

async fn handle_client(stream: TcpStream, shutdown: CancellationToken) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let (proxy, mut events) = TransportProxy::new();
    let proxy = Arc::new(proxy);
    // Opens run concurrently so a slow handshake does not hold up other requests
    let (replies_tx, mut replies) = mpsc::unbounded_channel::<ProxyEvent>();

    let result = async {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                read = reader.read_line(&mut line) => {
                    if read? == 0 {
                        break;
                    }
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        match serde_json::from_str::<ProxyRequest>(trimmed) {
                            Ok(request) => {
                                if let Some(reply) = handle_request(request, &proxy, &replies_tx) {
                                    write_event(&mut writer, &reply).await?;
                                }
                            }
                            Err(e) => {
                                let reply = ProxyEvent::Error {
                                    connection_id: None,
                                    request_id: None,
                                    message: format!("Invalid request: {}", e),
                                };
                                write_event(&mut writer, &reply).await?;
                            }
                        }
                    }
                    line.clear();
                }

                Some(event) = events.recv() => write_event(&mut writer, &event).await?,
                Some(reply) = replies.recv() => write_event(&mut writer, &reply).await?,
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    proxy.close_all();
    result
}

fn handle_request(
    request: ProxyRequest,
    proxy: &Arc<TransportProxy>,
    replies: &mpsc::UnboundedSender<ProxyEvent>,
) -> Option<ProxyEvent> {
    match request {
        ProxyRequest::Open(open) => {
            let proxy = Arc::clone(proxy);
            let replies = replies.clone();
            tokio::spawn(async move {
                let request_id = open.request_id.clone();
                if let Err(e) = proxy.open(open).await {
                    let _ = replies.send(ProxyEvent::Error {
                        connection_id: None,
                        request_id,
                        message: e.to_string(),
                    });
                }
            });
            None
        }
        ProxyRequest::Send {
            connection_id,
            data,
        } => proxy
            .send(&connection_id, data)
            .err()
            .map(|e| ProxyEvent::Error {
                connection_id: Some(connection_id),
                request_id: None,
                message: e.to_string(),
            }),
        ProxyRequest::Close {
            connection_id,
            code,
            reason,
        } => proxy
            .close(&connection_id, code, reason)
            .err()
            .map(|e| ProxyEvent::Error {
                connection_id: Some(connection_id),
                request_id: None,
                message: e.to_string(),
            }),
    }
}
