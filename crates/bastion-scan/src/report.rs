//! Scan reports and the merge policy used to combine engine verdicts.

use crate::warning::WarningClass;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// A file handed to the scan pipeline.
///
/// Identity is the path; the display name is kept for presentation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ScanTarget {
    path: PathBuf,
    name: String,
}

impl ScanTarget {
    /// Create a target for `path`, using the final path component as display name
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the target still refers to something on disk
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Per-engine vote counters reported by the remote reputation engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineVotes {
    pub malicious: u32,
    pub harmless: u32,
    pub suspicious: u32,
    pub undetected: u32,
}

impl EngineVotes {
    /// Total number of votes cast
    pub fn total(&self) -> u64 {
        [self.malicious, self.harmless, self.suspicious, self.undetected]
            .iter()
            .map(|&n| u64::from(n))
            .sum()
    }

    /// Share of malicious votes in percent (0 when nobody voted)
    pub fn detection_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.malicious as f64 * 100.0 / total as f64
        }
    }

    fn accumulate(&mut self, other: &EngineVotes) {
        self.malicious = self.malicious.saturating_add(other.malicious);
        self.harmless = self.harmless.saturating_add(other.harmless);
        self.suspicious = self.suspicious.saturating_add(other.suspicious);
        self.undetected = self.undetected.saturating_add(other.undetected);
    }
}

/// Outcome of analysing one file.
///
/// `threat_detected` always agrees with `warning`: it is true iff the class
/// is [`WarningClass::Suspicious`] or [`WarningClass::Dangerous`]. All
/// mutation goes through methods that keep the two consistent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    target: ScanTarget,
    threat_detected: bool,
    details: String,
    warning: WarningClass,
    valid: bool,
    analysis_id: Option<String>,
    sha256: Option<String>,
    votes: EngineVotes,
}

impl ScanReport {
    /// Empty report: clear, valid, no details
    pub fn new(target: ScanTarget) -> Self {
        Self {
            target,
            threat_detected: false,
            details: String::new(),
            warning: WarningClass::Clear,
            valid: true,
            analysis_id: None,
            sha256: None,
            votes: EngineVotes::default(),
        }
    }

    /// Report for an engine that could not produce a verdict
    pub fn invalid(target: ScanTarget, details: impl Into<String>) -> Self {
        let mut report = Self::new(target);
        report.details = details.into();
        report.valid = false;
        report
    }

    pub fn target(&self) -> &ScanTarget {
        &self.target
    }

    pub fn threat_detected(&self) -> bool {
        self.threat_detected
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn warning(&self) -> WarningClass {
        self.warning
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn analysis_id(&self) -> Option<&str> {
        self.analysis_id.as_deref()
    }

    pub fn sha256(&self) -> Option<&str> {
        self.sha256.as_deref()
    }

    pub fn votes(&self) -> EngineVotes {
        self.votes
    }

    /// Set the verdict and its explanation
    pub fn set_verdict(&mut self, warning: WarningClass, details: impl Into<String>) {
        self.warning = warning;
        self.threat_detected = warning.is_threat();
        self.details = details.into();
    }

    pub fn set_votes(&mut self, votes: EngineVotes) {
        self.votes = votes;
    }

    pub fn set_sha256(&mut self, sha256: impl Into<String>) {
        self.sha256 = Some(sha256.into());
    }

    pub fn set_analysis_id(&mut self, id: impl Into<String>) {
        self.analysis_id = Some(id.into());
    }

    /// Append a note to the details without touching the verdict
    pub fn annotate(&mut self, note: &str) {
        if self.details.is_empty() {
            self.details.push_str(note);
        } else {
            self.details.push_str("; ");
            self.details.push_str(note);
        }
    }

    /// Fold another engine's report into this one.
    ///
    /// A threatening `source` replaces the details (last engine wins), raises
    /// the class only if it is more severe, and adds its votes. A differing
    /// hash from `source` is adopted. Validity can only go down.
    pub fn merge(&mut self, source: Option<&ScanReport>) {
        let Some(source) = source else {
            return;
        };

        if source.threat_detected {
            self.threat_detected = true;
            self.details = source.details.clone();
            if source.warning.is_more_severe_than(self.warning) {
                self.warning = source.warning;
            }
            self.votes.accumulate(&source.votes);
        }

        if let Some(hash) = &source.sha256 {
            if self.sha256.as_ref() != Some(hash) {
                self.sha256 = Some(hash.clone());
            }
        }

        if self.analysis_id.is_none() {
            self.analysis_id = source.analysis_id.clone();
        }

        self.valid = self.valid && source.valid;
    }
}

impl fmt::Display for ScanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.warning, self.target.name())?;
        if !self.valid {
            write!(f, " (incomplete)")?;
        }
        if !self.details.is_empty() {
            write!(f, ": {}", self.details)?;
        }
        Ok(())
    }
}
