//! Transport proxy
//!
//! Opens the duplex stream connection to an agent on behalf of a process
//! that cannot open sockets itself, and relays frames both ways without
//! looking at their contents. Every `open` gets its own connection.

mod ipc;
mod relay;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProxyError;

pub use ipc::{ProxyIpcServer, ProxyRequest};
use relay::{Relay, RelayCommand};

/// Close code reported when the connection drops without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code used when the caller does not give one
pub const NORMAL_CLOSURE: u16 = 1000;

/// Request to open one relayed connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequest {
    /// Agent base URL, e.g. `http://127.0.0.1:40123` or `ws://...`
    pub target: String,
    pub session_id: String,
    /// Echoed back on `opened`/`error` so callers can match replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// What the proxy reports back to its caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    #[serde(rename_all = "camelCase")]
    Opened {
        connection_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Message { connection_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    Closed {
        connection_id: String,
        code: u16,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
}

/// Stream endpoint for `session_id` on the agent at `target`
pub fn stream_url(target: &str, session_id: &str) -> String {
    let target = target.trim_end_matches('/');
    let base = if let Some(rest) = target.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = target.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if target.starts_with("ws://") || target.starts_with("wss://") {
        target.to_string()
    } else {
        format!("ws://{}", target)
    };
    format!("{}/terminals/{}/stream", base, session_id)
}

/// Relay over any number of independent stream connections
pub struct TransportProxy {
    relays: DashMap<String, Relay>,
    events: mpsc::UnboundedSender<ProxyEvent>,
}

impl TransportProxy {
    /// New proxy and the receiver for its events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProxyEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let proxy = Self {
            relays: DashMap::new(),
            events,
        };
        (proxy, rx)
    }

    /// Connect to the session's stream endpoint. Emits `opened` before any
    /// relayed message; returns the new connection id.
    pub async fn open(&self, request: OpenRequest) -> Result<String, ProxyError> {
        let url = stream_url(&request.target, &request.session_id);
        let connection_id = uuid::Uuid::new_v4().to_string();

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ProxyError::Connect {
                url: url.clone(),
                message: e.to_string(),
            })?;

        tracing::info!(connection_id = %connection_id, "Proxy connected to {}", url);
        let _ = self.events.send(ProxyEvent::Opened {
            connection_id: connection_id.clone(),
            session_id: request.session_id,
            request_id: request.request_id,
        });

        let relay = relay::spawn(connection_id.clone(), socket, self.events.clone());
        self.relays.insert(connection_id.clone(), relay);
        Ok(connection_id)
    }

    /// Write a text frame on the real connection
    pub fn send(&self, connection_id: &str, data: String) -> Result<(), ProxyError> {
        self.command(connection_id, RelayCommand::Send(data))
    }

    /// Close the real connection; `closed` follows with the final code and reason
    pub fn close(
        &self,
        connection_id: &str,
        code: Option<u16>,
        reason: Option<String>,
    ) -> Result<(), ProxyError> {
        let result = self.command(
            connection_id,
            RelayCommand::Close {
                code: code.unwrap_or(NORMAL_CLOSURE),
                reason: reason.unwrap_or_default(),
            },
        );
        self.relays.remove(connection_id);
        result
    }

    /// Close every connection this proxy opened
    pub fn close_all(&self) {
        let ids: Vec<String> = self.relays.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            let _ = self.close(&id, None, Some("proxy closed".to_string()));
        }
    }

    /// Connections whose relay is still running
    pub fn open_connections(&self) -> usize {
        self.relays.retain(|_, relay| !relay.is_finished());
        self.relays.len()
    }

    fn command(&self, connection_id: &str, command: RelayCommand) -> Result<(), ProxyError> {
        let relay = self
            .relays
            .get(connection_id)
            .ok_or_else(|| ProxyError::UnknownConnection(connection_id.to_string()))?;
        relay
            .send(command)
            .map_err(|_| ProxyError::Closed(connection_id.to_string()))
    }
}

impl Drop for TransportProxy {
    fn drop(&mut self) {
        self.close_all();
    }
}
