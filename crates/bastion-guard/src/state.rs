//! Tunnel and guardian state

use serde::Serialize;
use std::fmt;

/// VPN tunnel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Tunnel is up and has completed a handshake
    Connected,
    /// Interface exists but no recent handshake
    ConnectionInProgress,
    /// No tunnel
    #[default]
    Disconnected,
}

impl ConnectionState {
    /// Only a completed connection counts as protected
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "CONNECTED"),
            Self::ConnectionInProgress => write!(f, "CONNECTION_IN_PROGRESS"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Whether the guardian loop should keep running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardianState {
    Up,
    #[default]
    Down,
}

impl GuardianState {
    pub fn is_up(&self) -> bool {
        matches!(self, GuardianState::Up)
    }
}

impl fmt::Display for GuardianState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
        }
    }
}
