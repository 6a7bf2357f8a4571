//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding stream messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Message was not valid JSON or did not match any known shape
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Binary frame did not contain UTF-8 text
    #[error("Frame is not valid UTF-8")]
    NotText,
}
