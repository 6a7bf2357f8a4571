//! End-to-end tests of the agent's HTTP and WebSocket surface

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use rmx_agent::AgentServer;
use rmx_core::config::AgentConfig;
use rmx_protocol::{
    HealthResponse, ServerMessage, TerminalCreated, TerminalInfo, Workspace, PROTOCOL_VERSION,
};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestAgent {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    http: reqwest::Client,
    _dir: tempfile::TempDir,
    workspace_path: String,
}

impl TestAgent {
    async fn start(config: AgentConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = AgentServer::from_listener(listener, config);
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(server.run());
        let dir = tempfile::tempdir().unwrap();
        let workspace_path = dir.path().display().to_string();

        Self {
            addr,
            shutdown,
            handle,
            http: reqwest::Client::new(),
            _dir: dir,
            workspace_path,
        }
    }

    async fn start_default() -> Self {
        Self::start(AgentConfig {
            idle_shutdown: false,
            default_shell: Some("/bin/sh".to_string()),
            ..AgentConfig::default()
        })
        .await
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn workspace(&self) -> Workspace {
        self.http
            .post(self.url("/workspaces"))
            .json(&json!({ "name": "test", "path": self.workspace_path }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn terminal(&self, workspace: &Workspace) -> TerminalCreated {
        let response = self
            .http
            .post(self.url(&format!("/workspaces/{}/terminals", workspace.id)))
            .json(&json!({ "shell": "/bin/sh", "cols": 80, "rows": 24 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        response.json().await.unwrap()
    }

    async fn stream(&self, terminal_id: &str) -> Ws {
        let url = format!("ws://{}/terminals/{}/stream", self.addr, terminal_id);
        let (mut ws, _) = connect_async(url).await.unwrap();
        match next_message(&mut ws).await {
            Some(ServerMessage::Connected { terminal_id: id, .. }) => assert_eq!(id, terminal_id),
            other => panic!("expected connected, got {:?}", other),
        }
        ws
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

async fn next_message(ws: &mut Ws) -> Option<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .ok()??
            .ok()?;
        match frame {
            Message::Text(text) => return Some(ServerMessage::from_json(&text).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Collect `data` frames until `needle` shows up
async fn read_until(ws: &mut Ws, needle: &str) -> String {
    let mut seen = String::new();
    while !seen.contains(needle) {
        match next_message(ws).await {
            Some(ServerMessage::Data { data }) => seen.push_str(&data),
            other => panic!("waiting for {:?}, got {:?} after {:?}", needle, other, seen),
        }
    }
    seen
}

#[tokio::test]
async fn test_health() {
    let agent = TestAgent::start_default().await;

    let health: HealthResponse = agent
        .http
        .get(agent.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(health.is_ok());
    assert_eq!(health.sessions, 0);
    assert_eq!(health.protocol.as_deref(), Some(PROTOCOL_VERSION));

    agent.stop().await;
}

#[tokio::test]
async fn test_workspace_crud() {
    let agent = TestAgent::start_default().await;

    let ws = agent.workspace().await;
    assert_eq!(ws.name, "test");

    let listed: Vec<Workspace> = agent
        .http
        .get(agent.url("/workspaces"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed, vec![ws.clone()]);

    let bad = agent
        .http
        .post(agent.url("/workspaces"))
        .json(&json!({ "name": "bad", "path": "/no/such/place" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

    let deleted = agent
        .http
        .delete(agent.url(&format!("/workspaces/{}", ws.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);

    let missing = agent
        .http
        .get(agent.url(&format!("/workspaces/{}", ws.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    agent.stop().await;
}

#[tokio::test]
async fn test_terminal_starts_in_workspace_directory() {
    let agent = TestAgent::start_default().await;
    let ws = agent.workspace().await;
    let term = agent.terminal(&ws).await;
    assert!(term.pid > 0);

    let mut stream = agent.stream(&term.id).await;
    send_json(&mut stream, json!({ "type": "input", "data": "pwd; echo done-$((2*3))\n" })).await;
    let output = read_until(&mut stream, "done-6").await;

    let canonical = std::fs::canonicalize(&agent.workspace_path).unwrap();
    let dir_name = canonical.file_name().unwrap().to_string_lossy().into_owned();
    assert!(output.contains(&dir_name), "output: {:?}", output);

    agent.stop().await;
}

#[tokio::test]
async fn test_resize_before_input_applies() {
    let agent = TestAgent::start_default().await;
    let ws = agent.workspace().await;
    let term = agent.terminal(&ws).await;

    let mut stream = agent.stream(&term.id).await;
    send_json(&mut stream, json!({ "type": "resize", "cols": 100, "rows": 40 })).await;
    send_json(&mut stream, json!({ "type": "input", "data": "stty size\n" })).await;
    read_until(&mut stream, "40 100").await;

    let info: TerminalInfo = agent
        .http
        .get(agent.url(&format!("/terminals/{}", term.id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!((info.cols, info.rows), (100, 40));
    assert_eq!(info.viewers, 1);

    agent.stop().await;
}

#[tokio::test]
async fn test_two_viewers_share_output_and_survive_detach() {
    let agent = TestAgent::start_default().await;
    let ws = agent.workspace().await;
    let term = agent.terminal(&ws).await;

    let mut a = agent.stream(&term.id).await;
    let mut b = agent.stream(&term.id).await;

    send_json(&mut a, json!({ "type": "input", "data": "echo both-$((1+1))\n" })).await;
    read_until(&mut a, "both-2").await;
    read_until(&mut b, "both-2").await;

    a.close(None).await.unwrap();
    drop(a);

    send_json(&mut b, json!({ "type": "input", "data": "echo after-$((3+3))\n" })).await;
    read_until(&mut b, "after-6").await;

    b.close(None).await.unwrap();
    drop(b);

    // Zero viewers: the terminal keeps running
    tokio::time::sleep(Duration::from_millis(200)).await;
    let info: TerminalInfo = agent
        .http
        .get(agent.url(&format!("/terminals/{}", term.id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info.viewers, 0);
    assert_eq!(info.pid, term.pid);

    agent.stop().await;
}

#[tokio::test]
async fn test_process_exit_sends_exit_and_closes() {
    let agent = TestAgent::start_default().await;
    let ws = agent.workspace().await;
    let term = agent.terminal(&ws).await;

    let mut stream = agent.stream(&term.id).await;
    send_json(&mut stream, json!({ "type": "input", "data": "exit 3\n" })).await;

    loop {
        match next_message(&mut stream).await {
            Some(ServerMessage::Data { .. }) => continue,
            Some(ServerMessage::Exit { exit_code, .. }) => {
                assert_eq!(exit_code, Some(3));
                break;
            }
            other => panic!("expected exit, got {:?}", other),
        }
    }
    assert!(next_message(&mut stream).await.is_none());

    let missing = agent
        .http
        .get(agent.url(&format!("/terminals/{}", term.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    agent.stop().await;
}

#[tokio::test]
async fn test_delete_terminal_closes_viewers() {
    let agent = TestAgent::start_default().await;
    let ws = agent.workspace().await;
    let term = agent.terminal(&ws).await;
    let mut stream = agent.stream(&term.id).await;

    let deleted = agent
        .http
        .delete(agent.url(&format!("/terminals/{}", term.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);

    loop {
        match next_message(&mut stream).await {
            Some(ServerMessage::Data { .. }) => continue,
            Some(ServerMessage::Exit { .. }) => break,
            other => panic!("expected exit, got {:?}", other),
        }
    }

    let terminals: Vec<TerminalInfo> = agent
        .http
        .get(agent.url("/terminals"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(terminals.is_empty());

    agent.stop().await;
}

#[tokio::test]
async fn test_unknown_terminal_stream_is_rejected() {
    let agent = TestAgent::start_default().await;
    let url = format!("ws://{}/terminals/nope/stream", agent.addr);
    assert!(connect_async(url).await.is_err());
    agent.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_reports_error() {
    let agent = TestAgent::start_default().await;
    let ws = agent.workspace().await;
    let term = agent.terminal(&ws).await;
    let mut stream = agent.stream(&term.id).await;

    stream
        .send(Message::Text("{\"type\":\"bogus\"}".to_string()))
        .await
        .unwrap();
    loop {
        match next_message(&mut stream).await {
            Some(ServerMessage::Data { .. }) => continue,
            Some(ServerMessage::Error { message }) => {
                assert!(message.contains("Invalid message"));
                break;
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    agent.stop().await;
}

#[tokio::test]
async fn test_idle_shutdown_stops_agent_and_exits_viewers() {
    let agent = TestAgent::start(AgentConfig {
        idle_shutdown: true,
        idle_timeout: Duration::from_millis(400),
        default_shell: Some("/bin/sh".to_string()),
        ..AgentConfig::default()
    })
    .await;
    let ws = agent.workspace().await;
    let term = agent.terminal(&ws).await;
    let mut stream = agent.stream(&term.id).await;

    loop {
        match next_message(&mut stream).await {
            Some(ServerMessage::Data { .. }) => continue,
            Some(ServerMessage::Exit { .. }) => break,
            other => panic!("expected exit on idle shutdown, got {:?}", other),
        }
    }

    tokio::time::timeout(Duration::from_secs(10), agent.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
