//! Bastion Guard - keeps protection coherent while the VPN is up
//!
//! The [`Supervisor`] is the single place that starts and stops the scan
//! pipeline, the download watcher and the tunnel. Its guardian loop checks
//! every 200ms that a connected tunnel is always backed by a running
//! pipeline and watcher, and shuts everything down when it is not.
//!
//! ```text
//!            ┌──────────────────── Supervisor ────────────────────┐
//!            │                                                    │
//!            │   guardian thread (200ms)                          │
//!            │     tunnel CONNECTED?                              │
//!            │       yes: pipeline + watcher UP? else cascade     │
//!            │       no:  stop pipeline, stop watcher             │
//!            └──────┬──────────────────┬──────────────────┬───────┘
//!                   ▼                  ▼                  ▼
//!            ┌─────────────┐   ┌───────────────┐   ┌─────────────┐
//!            │ScanPipeline │◀──│DownloadWatcher│   │   Tunnel    │
//!            │             │   │   (notify)    │   │ (wg-quick)  │
//!            └─────────────┘   └───────────────┘   └─────────────┘
//! ```

mod state;
mod supervisor;
mod tunnel;
mod watcher;

pub use bastion_scan::RunningState;
pub use state::{ConnectionState, GuardianState};
pub use supervisor::{GuardianVerdict, Supervisor, SupervisorError, TunnelOp, GUARDIAN_INTERVAL};
pub use tunnel::{Tunnel, TunnelConfig, TunnelError, WgQuickTunnel};
pub use watcher::{DownloadWatcher, FileSink, Watcher, WatcherConfig, WatcherError};
