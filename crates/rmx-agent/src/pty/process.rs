//! PTY process spawning
//!
//! Spawns a login shell on a pseudo-terminal using the portable-pty crate.
//! Writes and resizes are funnelled through a single I/O thread that owns
//! the PTY master, so input from several viewers reaches the shell in the
//! order it was submitted and a resize is applied before any input queued
//! after it.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use rmx_protocol::TerminalSize;

/// Allowed shell paths (prevents arbitrary command execution)
const ALLOWED_SHELLS_UNIX: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/fish",
    "/bin/dash",
    "/bin/ksh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/bin/dash",
    "/usr/bin/ksh",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/bash",
    "/opt/homebrew/bin/zsh",
    "/opt/homebrew/bin/fish",
];

/// Environment every session starts with; request env overrides it
const BASE_ENV: &[(&str, &str)] = &[
    ("TERM", "xterm-256color"),
    ("COLORTERM", "truecolor"),
    ("LANG", "en_US.UTF-8"),
];

/// Validate that a shell path is allowed and exists
pub fn validate_shell_path(shell: &str) -> Result<String> {
    let allowed = ALLOWED_SHELLS_UNIX.contains(&shell);

    if !allowed {
        let listed = std::fs::read_to_string("/etc/shells")
            .map(|shells| {
                shells.lines().any(|line| {
                    let line = line.trim();
                    !line.starts_with('#') && line == shell
                })
            })
            .unwrap_or(false);

        if !listed {
            anyhow::bail!(
                "Shell '{}' is not in the allowed shell list or /etc/shells",
                shell
            );
        }
    }

    if !Path::new(shell).exists() {
        anyhow::bail!("Shell '{}' does not exist", shell);
    }

    Ok(shell.to_string())
}

/// Pick the shell to run: request, then configured default, then `$SHELL`, then `/bin/sh`
pub fn resolve_shell(requested: Option<&str>, default_shell: Option<&str>) -> String {
    requested
        .map(str::to_string)
        .or_else(|| default_shell.map(str::to_string))
        .or_else(|| std::env::var("SHELL").ok())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Parameters for spawning a PTY-backed shell
#[derive(Debug, Clone)]
pub struct PtySpawnRequest {
    /// Validated shell path
    pub shell: String,
    /// Working directory
    pub cwd: PathBuf,
    /// Initial geometry
    pub size: TerminalSize,
    /// Extra environment, applied after the base environment
    pub env: Vec<(String, String)>,
    /// Start as a login shell (`-l`)
    pub login: bool,
}

/// Commands processed in order by the PTY I/O thread
#[derive(Debug)]
pub enum PtyCommand {
    /// Write bytes to the PTY master
    Write(Vec<u8>),
    /// Change the PTY window size
    Resize(TerminalSize),
}

/// Handle to a running PTY process
pub struct PtyProcess {
    pid: u32,
    commands: mpsc::UnboundedSender<PtyCommand>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

/// A freshly spawned PTY: the control handle plus the pieces that must be
/// driven by dedicated blocking tasks (output reader and exit waiter)
pub struct SpawnedPty {
    pub process: PtyProcess,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawn a shell on a new pseudo-terminal
pub fn spawn(request: PtySpawnRequest) -> Result<SpawnedPty> {
    let size = request.size.sanitized();
    tracing::info!(
        shell = %request.shell,
        cwd = %request.cwd.display(),
        "Spawning PTY {}x{}",
        size.cols,
        size.rows
    );

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(pty_size(size))
        .with_context(|| "Failed to open PTY")?;

    let mut cmd = CommandBuilder::new(&request.shell);
    if request.login {
        cmd.arg("-l");
    }
    cmd.cwd(&request.cwd);
    for (key, value) in BASE_ENV {
        cmd.env(key, value);
    }
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("Failed to spawn shell: {}", request.shell))?;
    // Only the child should hold the slave side, so EOF follows process exit
    drop(pair.slave);

    let pid = child.process_id().unwrap_or(0);
    tracing::info!("Spawned shell process with PID: {}", pid);

    let reader = pair
        .master
        .try_clone_reader()
        .with_context(|| "Failed to clone PTY reader")?;
    let writer = pair
        .master
        .take_writer()
        .with_context(|| "Failed to take PTY writer")?;
    let killer = child.clone_killer();

    let (commands, command_rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name(format!("pty-io-{}", pid))
        .spawn(move || run_io_thread(pair.master, writer, command_rx))
        .with_context(|| "Failed to start PTY I/O thread")?;

    Ok(SpawnedPty {
        process: PtyProcess {
            pid,
            commands,
            killer: Mutex::new(killer),
        },
        reader,
        child,
    })
}

fn run_io_thread(
    master: Box<dyn MasterPty + Send>,
    mut writer: Box<dyn Write + Send>,
    mut commands: mpsc::UnboundedReceiver<PtyCommand>,
) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            PtyCommand::Write(data) => {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    tracing::debug!("PTY write failed: {}", e);
                    break;
                }
            }
            PtyCommand::Resize(size) => {
                if let Err(e) = master.resize(pty_size(size.sanitized())) {
                    tracing::warn!("PTY resize failed: {}", e);
                }
            }
        }
    }
    tracing::debug!("PTY I/O thread exiting");
}

impl PtyProcess {
    /// Process id of the shell (0 if unknown)
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Queue bytes for the shell. Fails once the I/O thread has stopped.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.commands
            .send(PtyCommand::Write(data.into()))
            .map_err(|_| anyhow::anyhow!("PTY is closed"))
    }

    /// Queue a window-size change, ordered with respect to writes
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        self.commands
            .send(PtyCommand::Resize(size))
            .map_err(|_| anyhow::anyhow!("PTY is closed"))
    }

    /// Terminate the process
    pub fn kill(&self) {
        match self.killer.lock() {
            Ok(mut killer) => {
                if let Err(e) = killer.kill() {
                    tracing::debug!("Kill of PID {} failed: {}", self.pid, e);
                }
            }
            Err(_) => tracing::warn!("PTY killer lock poisoned for PID {}", self.pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_unknown_shell() {
        assert!(validate_shell_path("/usr/bin/python3").is_err());
        assert!(validate_shell_path("/bin/does-not-exist-sh").is_err());
    }

    #[test]
    fn test_validate_accepts_sh() {
        assert_eq!(validate_shell_path("/bin/sh").unwrap(), "/bin/sh");
    }

    #[test]
    fn test_resolve_shell_precedence() {
        assert_eq!(resolve_shell(Some("/bin/bash"), Some("/bin/zsh")), "/bin/bash");
        assert_eq!(resolve_shell(None, Some("/bin/zsh")), "/bin/zsh");
    }

    #[test]
    fn test_spawn_echo_and_exit() {
        let spawned = spawn(PtySpawnRequest {
            shell: "/bin/sh".to_string(),
            cwd: std::env::temp_dir(),
            size: TerminalSize::new(80, 24),
            env: vec![],
            login: false,
        })
        .unwrap();

        let SpawnedPty {
            process,
            mut reader,
            mut child,
        } = spawned;
        assert!(process.pid() > 0);

        process.write("echo remux-$((40+2))\nexit\n").unwrap();

        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
            }
            if String::from_utf8_lossy(&output).contains("remux-42") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&output).contains("remux-42"));
        let status = child.wait().unwrap();
        assert!(status.success());
    }
}
