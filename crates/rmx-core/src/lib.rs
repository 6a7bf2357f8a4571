//! rmx-core: Core abstractions and configuration for remux
//!
//! Shared by the remote agent, the local control plane and the CLI:
//! connection identity and state machine, the error taxonomy, and the
//! TOML/environment configuration structures.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use error::{ConfigError, ConnectError, RmxError};
pub use types::{ConnectionId, ConnectionState};
