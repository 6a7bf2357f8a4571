//! Client session adapter in local mode

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use rmx_client::{
    ConnectionManager, RoutingMode, SessionAdapter, TerminalError, TerminalEvent, TerminalRequest,
};
use rmx_core::config::ClientConfig;
use rmx_protocol::TerminalSize;

fn adapter() -> SessionAdapter {
    SessionAdapter::new(Arc::new(ConnectionManager::new(ClientConfig::default())))
}

fn local_request(dir: &tempfile::TempDir) -> TerminalRequest {
    TerminalRequest {
        connection: None,
        cwd: Some(dir.path().display().to_string()),
        shell: Some("/bin/sh".to_string()),
        size: TerminalSize::new(80, 24),
    }
}

/// Collect output until `needle` shows up
async fn read_until(events: &mut mpsc::UnboundedReceiver<TerminalEvent>, needle: &str) -> String {
    let mut seen = String::new();
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if let TerminalEvent::Output(text) = event {
                seen.push_str(&text);
                if seen.contains(needle) {
                    return true;
                }
            }
        }
        false
    })
    .await;
    assert!(matches!(found, Ok(true)), "never saw {:?} in {:?}", needle, seen);
    seen
}

#[tokio::test]
async fn test_output_before_ready_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = adapter();
    let terminal = adapter.open_terminal(local_request(&dir)).await.unwrap();
    assert_eq!(terminal.mode(), RoutingMode::Local);
    assert!(terminal.session_id().is_some());

    // Typed and answered before the renderer is attached
    terminal.write("echo ready-$((6*7))\n").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (sink, mut events) = mpsc::unbounded_channel();
    terminal.mark_ready(sink).unwrap();
    read_until(&mut events, "ready-42").await;

    terminal.write("pwd\n").unwrap();
    let dir_name = dir.path().file_name().unwrap().to_string_lossy().to_string();
    read_until(&mut events, &dir_name).await;
}

#[tokio::test]
async fn test_exit_code_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = adapter();
    let terminal = adapter.open_terminal(local_request(&dir)).await.unwrap();
    let (sink, mut events) = mpsc::unbounded_channel();
    terminal.mark_ready(sink).unwrap();

    terminal.write("exit 3\n").unwrap();
    let exit = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Some(TerminalEvent::Exit { exit_code, .. }) => return exit_code,
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(exit, Some(3));
}

#[tokio::test]
async fn test_ready_once_and_close() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = adapter();
    let terminal = adapter.open_terminal(local_request(&dir)).await.unwrap();

    let (sink, _events) = mpsc::unbounded_channel();
    terminal.mark_ready(sink.clone()).unwrap();
    assert!(matches!(
        terminal.mark_ready(sink),
        Err(TerminalError::AlreadyReady)
    ));

    terminal.resize(TerminalSize::new(100, 40)).unwrap();
    terminal.close();
    assert!(terminal.is_closed());
    assert!(matches!(terminal.write("ls\n"), Err(TerminalError::Closed)));
    // Closing twice is harmless
    terminal.close();
}

#[tokio::test]
async fn test_missing_cwd_fails() {
    let adapter = adapter();
    let request = TerminalRequest {
        cwd: Some("/no/such/dir/anywhere".to_string()),
        shell: Some("/bin/sh".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        adapter.open_terminal(request).await,
        Err(TerminalError::Local(_))
    ));
}
