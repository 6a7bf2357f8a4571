//! remux CLI
//!
//! Single binary for remote terminals over SSH:
//! - Deploying the session agent to a host
//! - Interactive shells (agent-backed, plain SSH, or local)
//! - Port forwards and the WebSocket transport proxy
//! - Running the agent itself on the remote side

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remux::commands::{self, AgentArgs};
use remux::output::print_error;
use remux::target::AuthArgs;

#[derive(Parser)]
#[command(name = "remux")]
#[command(author, version, about = "Remote terminals over SSH with persistent sessions")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install (if needed) and start the agent on a host
    Deploy {
        /// Host profile name or [user@]host[:port]
        target: String,
        #[command(flatten)]
        auth: AuthArgs,
    },

    /// Open an interactive terminal; local when no target is given
    Shell {
        /// Host profile name or [user@]host[:port]
        target: Option<String>,
        /// Working directory on the target
        #[arg(long)]
        cwd: Option<String>,
        /// Shell to spawn
        #[arg(short, long)]
        shell: Option<String>,
        #[command(flatten)]
        auth: AuthArgs,
    },

    /// List the agent's terminals on a host
    Sessions {
        /// Host profile name or [user@]host[:port]
        target: String,
        /// Terminate these terminals instead of listing
        #[arg(short, long)]
        kill: Vec<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        auth: AuthArgs,
    },

    /// Forward local ports through the SSH connection
    Forward {
        /// Host profile name or [user@]host[:port]
        target: String,
        /// LOCAL:HOST:REMOTE or LOCAL:REMOTE
        #[arg(required = true)]
        forwards: Vec<String>,
        #[command(flatten)]
        auth: AuthArgs,
    },

    /// Serve the WebSocket transport proxy on loopback
    Proxy {
        /// Port to listen on (0 picks a free port)
        #[arg(short, long, default_value_t = 0)]
        port: u16,
    },

    /// Run the session agent (normally started by `deploy`)
    Agent(AgentArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // The agent never reads the client config
    let settings = || commands::load_settings(cli.config.as_deref());
    match cli.command {
        Commands::Deploy { target, auth } => {
            commands::deploy_command(settings()?, &target, &auth).await
        }
        Commands::Shell {
            target,
            cwd,
            shell,
            auth,
        } => commands::shell_command(settings()?, target.as_deref(), &auth, cwd, shell).await,
        Commands::Sessions {
            target,
            kill,
            json,
            auth,
        } => commands::sessions_command(settings()?, &target, &auth, &kill, json).await,
        Commands::Forward {
            target,
            forwards,
            auth,
        } => commands::forward_command(settings()?, &target, &auth, &forwards).await,
        Commands::Proxy { port } => commands::proxy_command(port).await,
        Commands::Agent(args) => commands::agent_command(args).await,
    }
}
