//! Local signature engine backed by `clamscan`.

use super::{EngineError, ScanEngine};
use crate::config::LocalEngineConfig;
use crate::report::{ScanReport, ScanTarget};
use crate::warning::WarningClass;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Signature families that only indicate a heuristic match
const HEURISTIC_PREFIXES: &[&str] = &["Heuristics.", "PUA."];

/// Runs the local scanner synchronously as a subprocess.
pub struct LocalEngine {
    config: LocalEngineConfig,
    last: Mutex<Option<ScanReport>>,
}

/// What the scanner printed about one file
#[derive(Debug, Clone, PartialEq, Eq)]
struct Detection {
    signature: String,
    heuristic: bool,
}

impl LocalEngine {
    pub fn new(config: LocalEngineConfig) -> Self {
        Self {
            config,
            last: Mutex::new(None),
        }
    }

    fn scan(&self, target: &ScanTarget) -> Result<ScanReport, EngineError> {
        let sha256 = hash_file(target.path())
            .map_err(|e| EngineError::Unreadable(format!("{}: {}", target, e)))?;

        let output = Command::new(&self.config.clamscan_path)
            .args(&self.config.clamscan_args)
            .arg(target.path())
            .stdin(Stdio::null())
            .output()?;

        let mut report = ScanReport::new(target.clone());
        report.set_sha256(sha256);

        // clamscan: 0 = clean, 1 = virus found, anything else = error
        match output.status.code() {
            Some(0) => {
                report.set_verdict(WarningClass::Clear, "No signature matched");
            }
            Some(1) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let detections = parse_output(&stdout);
                let (warning, details) = classify(&detections);
                report.set_verdict(warning, details);
            }
            code => {
                return Err(EngineError::ScannerFailed {
                    code,
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
        }

        Ok(report)
    }
}

impl ScanEngine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    fn analyze(&self, target: &ScanTarget) -> ScanReport {
        let report = match self.scan(target) {
            Ok(report) => {
                debug!("{} scan of {}: {}", self.name(), target, report.warning());
                report
            }
            Err(e) => {
                warn!("{} scan of {} failed: {}", self.name(), target, e);
                ScanReport::invalid(target.clone(), e.to_string())
            }
        };

        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    fn last_report(&self) -> Option<ScanReport> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Hex SHA-256 of a file's content
fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    if !file.metadata()?.is_file() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
    }
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// Extract `<path>: <signature> FOUND` lines
fn parse_output(stdout: &str) -> Vec<Detection> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            let rest = line.strip_suffix(" FOUND")?;
            let (_, signature) = rest.rsplit_once(": ")?;
            let signature = signature.trim().to_string();
            let heuristic = HEURISTIC_PREFIXES.iter().any(|p| signature.starts_with(p));
            Some(Detection { signature, heuristic })
        })
        .collect()
}

fn classify(detections: &[Detection]) -> (WarningClass, String) {
    if detections.is_empty() {
        // Exit status said "found" but nothing parsed; treat as a heuristic hit
        return (
            WarningClass::Suspicious,
            "Scanner reported a match without a signature".to_string(),
        );
    }

    let warning = if detections.iter().any(|d| !d.heuristic) {
        WarningClass::Dangerous
    } else {
        WarningClass::Suspicious
    };

    let signatures: Vec<&str> = detections.iter().map(|d| d.signature.as_str()).collect();
    (warning, format!("Signature match: {}", signatures.join(", ")))
}
