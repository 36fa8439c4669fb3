//! VPN tunnel collaborator
//!
//! The supervisor only needs bring-up, tear-down and a connection state.
//! [`WgQuickTunnel`] provides them on top of the `wg-quick` and `wg` tools.

use crate::state::ConnectionState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Tunnel errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to execute {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed: {stderr}")]
    CommandFailed { tool: String, stderr: String },

    #[error("No tunnel is active")]
    NotActive,
}

/// A VPN tunnel the supervisor can control.
pub trait Tunnel: Send + Sync {
    /// Bring the tunnel up for `peer`
    fn bring_up(&self, peer: &str) -> Result<(), TunnelError>;

    /// Tear down the active tunnel
    fn tear_down(&self) -> Result<(), TunnelError>;

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;
}

/// `wg-quick` based tunnel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub wg_quick_path: PathBuf,
    pub wg_path: PathBuf,
    /// Peer used when none is given on the command line
    pub default_peer: Option<String>,
    /// A handshake older than this no longer counts as connected
    pub handshake_timeout_secs: u64,
}

impl TunnelConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            wg_quick_path: PathBuf::from("wg-quick"),
            wg_path: PathBuf::from("wg"),
            default_peer: None,
            handshake_timeout_secs: 180,
        }
    }
}

/// The tunnel brought up last
#[derive(Debug, Clone)]
struct ActiveTunnel {
    /// Argument given to `wg-quick up` (config name or path)
    peer: String,
    /// Kernel interface name
    interface: String,
}

/// WireGuard tunnel driven through `wg-quick`.
pub struct WgQuickTunnel {
    config: TunnelConfig,
    active: Mutex<Option<ActiveTunnel>>,
}

impl WgQuickTunnel {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            active: Mutex::new(None),
        }
    }

    /// Interface currently managed, if any
    pub fn interface(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.interface.clone())
    }

    fn wg_quick(&self, action: &str, peer: &str) -> Result<(), TunnelError> {
        let output = run(&self.config.wg_quick_path, &[action, peer])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TunnelError::CommandFailed {
                tool: format!("wg-quick {}", action),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl Tunnel for WgQuickTunnel {
    fn bring_up(&self, peer: &str) -> Result<(), TunnelError> {
        info!("Bringing up WireGuard tunnel {}", peer);
        self.wg_quick("up", peer)?;

        let interface = interface_name(peer);
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(ActiveTunnel {
            peer: peer.to_string(),
            interface,
        });
        Ok(())
    }

    fn tear_down(&self) -> Result<(), TunnelError> {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TunnelError::NotActive)?;

        info!("Tearing down WireGuard tunnel {}", active.peer);
        if let Err(e) = self.wg_quick("down", &active.peer) {
            // Keep tracking it so a later tear-down can retry
            *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(active);
            return Err(e);
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        let Some(interface) = self.interface() else {
            return ConnectionState::Disconnected;
        };

        match run(&self.config.wg_path, &["show", &interface, "latest-handshakes"]) {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                state_from_handshakes(&stdout, SystemTime::now(), self.config.handshake_timeout())
            }
            Ok(_) => ConnectionState::Disconnected,
            Err(e) => {
                debug!("{}", e);
                ConnectionState::Disconnected
            }
        }
    }
}

fn run(tool: &Path, args: &[&str]) -> Result<Output, TunnelError> {
    Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| TunnelError::Spawn {
            tool: tool.display().to_string(),
            source,
        })
}

/// `wg-quick` names the interface after the config file stem
fn interface_name(peer: &str) -> String {
    Path::new(peer)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| peer.to_string())
}

/// Interpret `wg show <iface> latest-handshakes` (`<pubkey>\t<unix secs>` per peer)
fn state_from_handshakes(stdout: &str, now: SystemTime, timeout: Duration) -> ConnectionState {
    let now_secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

    let fresh = stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|ts| ts.parse::<u64>().ok())
        .any(|ts| ts > 0 && now_secs.saturating_sub(ts) <= timeout.as_secs());

    if fresh {
        ConnectionState::Connected
    } else {
        ConnectionState::ConnectionInProgress
    }
}
