//! Scan engines
//!
//! An engine inspects one file and produces a [`ScanReport`]. Failures never
//! escape an engine: they come back as invalid reports so the pipeline can
//! keep going with whatever the other engine said.

mod local;
mod remote;

pub use local::LocalEngine;
pub use remote::RemoteEngine;

use crate::report::{ScanReport, ScanTarget};

/// Engine errors, converted into invalid reports by each engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("File is not readable: {0}")]
    Unreadable(String),

    #[error("Failed to launch scanner: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Scanner exited with status {code:?}: {stderr}")]
    ScannerFailed { code: Option<i32>, stderr: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response: {0}")]
    BadResponse(String),

    #[error("No API key configured")]
    MissingApiKey,
}

/// A capability that analyses one file.
pub trait ScanEngine: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &str;

    /// Analyse `target` and return the resulting report.
    ///
    /// The report is also kept as [`ScanEngine::last_report`].
    fn analyze(&self, target: &ScanTarget) -> ScanReport;

    /// The report produced by the most recent `analyze` call
    fn last_report(&self) -> Option<ScanReport>;
}
