//! Output formatting for the CLI

use tabled::{settings::Style, Table, Tabled};

use rmx_client::{ConnectionEvent, DeployOutcome, DeployReport};
use rmx_protocol::TerminalInfo;

/// Format agent terminals as a table
pub fn format_terminals(terminals: &[TerminalInfo]) -> String {
    if terminals.is_empty() {
        return "No active terminals".to_string();
    }

    #[derive(Tabled)]
    struct TerminalRow {
        #[tabled(rename = "TERMINAL ID")]
        id: String,
        #[tabled(rename = "PID")]
        pid: u32,
        #[tabled(rename = "SHELL")]
        shell: String,
        #[tabled(rename = "CWD")]
        cwd: String,
        #[tabled(rename = "SIZE")]
        size: String,
        #[tabled(rename = "VIEWERS")]
        viewers: usize,
    }

    let rows: Vec<TerminalRow> = terminals
        .iter()
        .map(|t| TerminalRow {
            id: truncate(&t.id, 12),
            pid: t.pid,
            shell: t.shell.clone(),
            cwd: t.cwd.clone(),
            size: format!("{}x{}", t.cols, t.rows),
            viewers: t.viewers,
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// One-line summary of a deployment
pub fn format_deploy(report: &DeployReport) -> String {
    let what = match report.outcome {
        DeployOutcome::AlreadyRunning => "Agent already running",
        DeployOutcome::Started => "Agent started",
        DeployOutcome::Installed => "Agent installed and started",
    };
    let version = report.health.version.as_deref().unwrap_or("unknown");
    match &report.runtime_version {
        Some(runtime) => format!("{} (agent {}, runtime {})", what, version, runtime),
        None => format!("{} (agent {})", what, version),
    }
}

/// Human-readable connection event, for progress output
pub fn format_event(event: &ConnectionEvent) -> String {
    match event {
        ConnectionEvent::StateChanged {
            id, to, error, ..
        } => match error {
            Some(error) => format!("{}: {} ({})", id, to, error),
            None => format!("{}: {}", id, to),
        },
        ConnectionEvent::Retrying {
            id,
            attempt,
            delay_ms,
            error,
        } => format!(
            "{}: reconnecting (attempt {}) in {}ms after: {}",
            id, attempt, delay_ms, error
        ),
        ConnectionEvent::Removed { id } => format!("{}: removed", id),
    }
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red to stderr
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan to stderr
///
/// Progress goes to stderr so stdout stays clean for tables and JSON.
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
