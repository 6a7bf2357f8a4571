//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a Connection in the manager registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a connection ID from a caller-chosen value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a Connection
///
/// ```text
/// DISCONNECTED -> CONNECTING -> CONNECTED -> RECONNECTING -> CONNECTED
///                     |                          |
///                     +--------> ERROR <---------+
/// ERROR -> CONNECTING (explicit retry)
/// any   -> DISCONNECTED (explicit close)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Registered, no socket open
    Disconnected,
    /// Establishing and authenticating
    Connecting,
    /// Authenticated; health probe running
    Connected,
    /// Health probe failed; retrying with backoff
    Reconnecting,
    /// Failed; waits for an explicit retry
    Error,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal edge of the state machine.
    ///
    /// Self-transitions are not edges. Every state may return to
    /// `Disconnected` because `disconnect` is unconditional.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (a, b) if a == b => false,
            (_, Disconnected) => true,
            (Disconnected, Connecting) | (Error, Connecting) => true,
            (Connecting, Connected) | (Connecting, Error) => true,
            (Connected, Reconnecting) => true,
            (Reconnecting, Connected) | (Reconnecting, Error) => true,
            _ => false,
        }
    }

    /// Whether `connect` may be called from this state
    pub fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const ALL: [ConnectionState; 5] = [Disconnected, Connecting, Connected, Reconnecting, Error];

    #[test]
    fn test_no_transition_skips_connecting() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Reconnecting));
        assert!(!Error.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Reconnecting));
    }

    #[test]
    fn test_listed_edges_allowed() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Error));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Error));
        assert!(Error.can_transition_to(Connecting));
    }

    #[test]
    fn test_every_state_can_disconnect() {
        for state in ALL {
            if state != Disconnected {
                assert!(state.can_transition_to(Disconnected), "{state}");
            }
        }
    }

    #[test]
    fn test_connected_only_reached_from_connecting_or_reconnecting() {
        for state in ALL {
            let allowed = state.can_transition_to(Connected);
            assert_eq!(allowed, matches!(state, Connecting | Reconnecting), "{state}");
        }
    }

    #[test]
    fn test_connection_id_generate_unique() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
        assert_eq!(ConnectionId::from("prod").to_string(), "prod");
    }
}
