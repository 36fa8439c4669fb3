//! Bastion Scan - multi-engine analysis of downloaded files
//!
//! Files discovered on disk are queued into a [`ScanPipeline`], analysed by a
//! local signature engine and, when the local verdict is a threat, by a remote
//! reputation engine throttled through a shared [`RateLimiter`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  submit   ┌──────────────┐        ┌──────────────┐
//! │ Watcher  │──────────▶│  ScanQueue   │───────▶│ scan-worker  │
//! │ Console  │           │ (FIFO, dedup)│        │   thread     │
//! └──────────┘           └──────────────┘        └──────┬───────┘
//!                                                       │
//!                     ┌─────────────────────────────────┼───────────────┐
//!                     ▼                                 ▼               │
//!              ┌─────────────┐   threat + size ok + ┌─────────────┐     │
//!              │ LocalEngine │   limiter admits     │RemoteEngine │     │
//!              │ (clamscan)  │─────────────────────▶│(VirusTotal) │     │
//!              └─────────────┘                      └─────────────┘     │
//!                                                                       ▼
//!                                                              merged ScanReport
//! ```

mod config;
mod engine;
mod pipeline;
mod rate_limiter;
mod report;
mod warning;

pub use config::{LocalEngineConfig, PipelineConfig, RemoteEngineConfig};
pub use engine::{EngineError, LocalEngine, RemoteEngine, ScanEngine};
pub use pipeline::ScanPipeline;
pub use rate_limiter::{RateLimiter, RATE_WINDOW};
pub use report::{EngineVotes, ScanReport, ScanTarget};
pub use warning::{RunningState, WarningClass};
