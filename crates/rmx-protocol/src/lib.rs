//! rmx-protocol: Wire types for remux
//!
//! Defines the tagged JSON messages exchanged on a terminal stream, the
//! request/response payloads of the agent's HTTP control surface, and a
//! streaming UTF-8 decoder used to turn raw PTY bytes into text frames.

pub mod api;
pub mod error;
pub mod message;
pub mod text;

pub use api::{
    CreateTerminalRequest, CreateWorkspaceRequest, HealthResponse, ResizeRequest, TerminalCreated,
    TerminalInfo, Workspace,
};
pub use error::ProtocolError;
pub use message::{ClientMessage, ServerMessage, TerminalSize, PROTOCOL_VERSION};
pub use text::Utf8Decoder;
