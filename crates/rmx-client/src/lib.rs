//! rmx-client: local control plane for remux
//!
//! Owns SSH connections and their tunnels, keeps them alive with a health
//! probe and reconnection backoff, bootstraps the remote agent, and routes
//! UI terminals to the agent, a direct SSH shell, or a local PTY.

pub mod agent_client;
pub mod backoff;
pub mod connection;
pub mod deploy;
pub mod error;
pub mod manager;
pub mod proxy;
pub mod terminal;
pub mod tunnel;

pub use agent_client::AgentClient;
pub use backoff::Backoff;
pub use connection::{Connection, ConnectionEvent, RemoteAgentRecord};
pub use deploy::{DeployOutcome, DeployReport, Deployer, RemoteHost};
pub use error::{DeployError, DeployStep, ProxyError, TerminalError, TunnelError};
pub use manager::{ConnectionManager, ConnectionSummary};
pub use proxy::{OpenRequest, ProxyEvent, ProxyIpcServer, TransportProxy};
pub use terminal::{RoutingMode, SessionAdapter, TerminalEvent, TerminalHandle, TerminalRequest};
pub use tunnel::{Tunnel, TunnelSpec};
