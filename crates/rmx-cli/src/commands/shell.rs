//! Interactive terminal command
//!
//! Opens a terminal through the session adapter and wires it to the local
//! tty in raw mode. Ctrl+] detaches; for agent terminals the remote shell
//! keeps running and can be listed with `remux sessions`.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tokio::sync::mpsc;

use rmx_client::{
    ConnectionManager, RoutingMode, SessionAdapter, TerminalEvent, TerminalHandle,
    TerminalRequest,
};
use rmx_core::config::ClientConfig;
use rmx_protocol::TerminalSize;

use crate::output::{print_error, print_info};
use crate::target::AuthArgs;

/// What ended an interactive session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutcome {
    Detached,
    Exited(Option<i32>),
    Failed(String),
}

pub async fn shell_command(
    settings: ClientConfig,
    target: Option<&str>,
    auth: &AuthArgs,
    cwd: Option<String>,
    shell: Option<String>,
) -> Result<()> {
    let manager = Arc::new(ConnectionManager::new(settings));
    let connection = match target {
        Some(target) => {
            let id = super::open_connection(&manager, target, auth).await?;
            if let Err(e) = manager.ensure_agent(&id).await {
                print_error(&format!("Agent unavailable, using a plain shell: {}", e));
            }
            Some(id)
        }
        None => None,
    };

    let adapter = SessionAdapter::new(Arc::clone(&manager));
    let size = terminal::size()
        .map(|(cols, rows)| TerminalSize::new(cols, rows))
        .unwrap_or_default();
    let handle = adapter
        .open_terminal(TerminalRequest {
            connection,
            cwd,
            shell,
            size,
        })
        .await?;

    if handle.mode() == RoutingMode::Agent {
        print_info("Attached to agent terminal (Ctrl+] to detach)");
    } else {
        print_info(&format!("Opened {} terminal (Ctrl+] to leave)", handle.mode()));
    }

    let outcome = run_interactive(&handle).await;
    handle.close();
    adapter.shutdown().await;
    manager.disconnect_all().await;

    match outcome? {
        ShellOutcome::Detached => {
            if let Some(session) = handle.session_id().filter(|_| handle.mode() == RoutingMode::Agent) {
                print_info(&format!("Detached from {}", session));
            }
        }
        ShellOutcome::Exited(Some(code)) if code != 0 => {
            print_info(&format!("Shell exited with status {}", code));
        }
        ShellOutcome::Exited(_) => {}
        ShellOutcome::Failed(message) => print_error(&message),
    }
    Ok(())
}

/// Restores cooked mode however the session ends
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

async fn run_interactive(handle: &TerminalHandle) -> Result<ShellOutcome> {
    let (sink, mut output) = mpsc::unbounded_channel();
    handle.mark_ready(sink)?;

    let _raw = RawModeGuard::enable()?;
    let mut stdout = std::io::stdout();

    let (input_tx, mut input) = mpsc::channel::<Event>(256);
    let reader = tokio::task::spawn_blocking(move || {
        while !input_tx.is_closed() {
            if event::poll(Duration::from_millis(10)).unwrap_or(false) {
                if let Ok(event) = event::read() {
                    if input_tx.blocking_send(event).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let outcome = loop {
        tokio::select! {
            event = output.recv() => match event {
                Some(TerminalEvent::Output(data)) => {
                    stdout.write_all(data.as_bytes())?;
                    stdout.flush()?;
                }
                Some(TerminalEvent::Exit { exit_code, .. }) => break ShellOutcome::Exited(exit_code),
                Some(TerminalEvent::Error(message)) => break ShellOutcome::Failed(message),
                None => break ShellOutcome::Exited(None),
            },
            Some(event) = input.recv() => match event {
                Event::Key(KeyEvent { code, modifiers, kind, .. }) => {
                    if kind != KeyEventKind::Press {
                        continue;
                    }
                    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char(']') {
                        break ShellOutcome::Detached;
                    }
                    let data = key_to_text(code, modifiers);
                    if !data.is_empty() {
                        handle.write(&data)?;
                    }
                }
                Event::Paste(text) => handle.write(&text)?,
                Event::Resize(cols, rows) => handle.resize(TerminalSize::new(cols, rows))?,
                _ => {}
            },
        }
    };

    drop(input);
    let _ = reader.await;
    Ok(outcome)
}

/// Bytes a terminal would send for a key press
pub fn key_to_text(code: KeyCode, modifiers: KeyModifiers) -> String {
    use KeyCode::*;

    let csi = |s: &str| format!("\x1b[{}", s);
    match code {
        Char(c) if modifiers.contains(KeyModifiers::CONTROL) && c.is_ascii_alphabetic() => {
            // Ctrl+A = 0x01 ... Ctrl+Z = 0x1a
            char::from(c.to_ascii_lowercase() as u8 - b'a' + 1).to_string()
        }
        Char(c) if modifiers.contains(KeyModifiers::ALT) => format!("\x1b{}", c),
        Char(c) => c.to_string(),
        Enter => "\r".to_string(),
        Tab => "\t".to_string(),
        BackTab => csi("Z"),
        Backspace => "\x7f".to_string(),
        Esc => "\x1b".to_string(),
        Up => csi("A"),
        Down => csi("B"),
        Right => csi("C"),
        Left => csi("D"),
        Home => csi("H"),
        End => csi("F"),
        PageUp => csi("5~"),
        PageDown => csi("6~"),
        Delete => csi("3~"),
        Insert => csi("2~"),
        F(n @ 1..=4) => format!("\x1bO{}", char::from(b'P' + n - 1)),
        F(n) => match n {
            5 => csi("15~"),
            6 => csi("17~"),
            7 => csi("18~"),
            8 => csi("19~"),
            9 => csi("20~"),
            10 => csi("21~"),
            11 => csi("23~"),
            12 => csi("24~"),
            _ => String::new(),
        },
        _ => String::new(),
    }
}
