//! Remote reputation engine (VirusTotal API v3)
//!
//! # Flow
//!
//! 1. Upload the file to `{base_url}/files`, receive an analysis id
//! 2. Record the upload in the shared [`RateLimiter`]
//! 3. Poll `{base_url}/analyses/{id}` until the status is `completed`
//! 4. Classify from the vote counters
//!
//! Polling has no deadline. A remote analysis that never completes keeps
//! the calling thread waiting until the service answers or errors.

use super::{EngineError, ScanEngine};
use crate::config::RemoteEngineConfig;
use crate::rate_limiter::RateLimiter;
use crate::report::{EngineVotes, ScanReport, ScanTarget};
use crate::warning::WarningClass;
use reqwest::blocking::{multipart, Client};
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

/// Detection percentage above which a file is dangerous
const DANGEROUS_PERCENTAGE: f64 = 70.0;

/// Malicious vote count above which a file is dangerous
const DANGEROUS_VOTES: u32 = 50;

const API_KEY_HEADER: &str = "x-apikey";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    data: UploadData,
}

#[derive(Debug, Deserialize)]
struct UploadData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    data: AnalysisData,
    #[serde(default)]
    meta: Option<AnalysisMeta>,
}

#[derive(Debug, Deserialize)]
struct AnalysisData {
    attributes: AnalysisAttributes,
}

#[derive(Debug, Deserialize)]
struct AnalysisAttributes {
    status: String,
    #[serde(default)]
    stats: AnalysisStats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnalysisStats {
    malicious: u32,
    harmless: u32,
    suspicious: u32,
    undetected: u32,
}

#[derive(Debug, Deserialize)]
struct AnalysisMeta {
    #[serde(default)]
    file_info: Option<FileInfo>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    #[serde(default)]
    sha256: Option<String>,
}

impl From<AnalysisStats> for EngineVotes {
    fn from(stats: AnalysisStats) -> Self {
        Self {
            malicious: stats.malicious,
            harmless: stats.harmless,
            suspicious: stats.suspicious,
            undetected: stats.undetected,
        }
    }
}

/// Uploads files for multi-vendor reputation analysis.
pub struct RemoteEngine {
    config: RemoteEngineConfig,
    client: Client,
    limiter: Arc<RateLimiter>,
    last: Mutex<Option<ScanReport>>,
}

impl RemoteEngine {
    /// Create the engine. `limiter` is shared with the pipeline that gates uploads.
    pub fn new(config: RemoteEngineConfig, limiter: Arc<RateLimiter>) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            config,
            client,
            limiter,
            last: Mutex::new(None),
        })
    }

    fn api_key(&self) -> Result<&str, EngineError> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(EngineError::MissingApiKey)
    }

    fn upload(&self, target: &ScanTarget) -> Result<String, EngineError> {
        let api_key = self.api_key()?;
        let form = multipart::Form::new()
            .file("file", target.path())
            .map_err(|e| EngineError::Unreadable(format!("{}: {}", target, e)))?;

        let response: UploadResponse = self
            .client
            .post(format!("{}/files", self.config.base_url))
            .header(API_KEY_HEADER, api_key)
            .multipart(form)
            .send()?
            .error_for_status()?
            .json()?;

        if response.data.id.is_empty() {
            return Err(EngineError::BadResponse("empty analysis id".to_string()));
        }
        Ok(response.data.id)
    }

    fn poll(&self, analysis_id: &str) -> Result<AnalysisResponse, EngineError> {
        let api_key = self.api_key()?;
        let url = format!("{}/analyses/{}", self.config.base_url, analysis_id);

        loop {
            let response: AnalysisResponse = self
                .client
                .get(&url)
                .header(API_KEY_HEADER, api_key)
                .send()?
                .error_for_status()?
                .json()?;

            if response.data.attributes.status == "completed" {
                return Ok(response);
            }

            debug!(
                "Analysis {} is {}, polling again in {}s",
                analysis_id,
                response.data.attributes.status,
                self.config.poll_interval_secs
            );
            thread::sleep(self.config.poll_interval());
        }
    }

    fn scan(&self, target: &ScanTarget) -> Result<ScanReport, EngineError> {
        let analysis_id = self.upload(target)?;
        self.limiter.record();
        info!("Uploaded {} for reputation analysis ({})", target.name(), analysis_id);

        let analysis = self.poll(&analysis_id)?;
        Ok(report_from_analysis(target, &analysis_id, analysis))
    }
}

impl ScanEngine for RemoteEngine {
    fn name(&self) -> &str {
        "remote"
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

/// Classify vote counters
fn classify(votes: &EngineVotes) -> WarningClass {
    if votes.detection_percentage() > DANGEROUS_PERCENTAGE || votes.malicious > DANGEROUS_VOTES {
        WarningClass::Dangerous
    } else if votes.malicious > 0 {
        WarningClass::Suspicious
    } else {
        WarningClass::Clear
    }
}

fn report_from_analysis(
    target: &ScanTarget,
    analysis_id: &str,
    analysis: AnalysisResponse,
) -> ScanReport {
    let votes = EngineVotes::from(analysis.data.attributes.stats);
    let warning = classify(&votes);

    let mut report = ScanReport::new(target.clone());
    report.set_analysis_id(analysis_id);
    report.set_verdict(
        warning,
        format!(
            "{}/{} engines flagged the file as malicious ({:.1}%)",
            votes.malicious,
            votes.total(),
            votes.detection_percentage()
        ),
    );
    report.set_votes(votes);

    if let Some(sha256) = analysis.meta.and_then(|m| m.file_info).and_then(|f| f.sha256) {
        report.set_sha256(sha256);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn votes(malicious: u32, harmless: u32, suspicious: u32, undetected: u32) -> EngineVotes {
        EngineVotes { malicious, harmless, suspicious, undetected }
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(classify(&votes(0, 60, 0, 10)), WarningClass::Clear);
        assert_eq!(classify(&votes(1, 60, 0, 10)), WarningClass::Suspicious);
        // Exactly 70% is not above the threshold
        assert_eq!(classify(&votes(7, 3, 0, 0)), WarningClass::Suspicious);
        assert_eq!(classify(&votes(8, 2, 0, 0)), WarningClass::Dangerous);
        // Many malicious votes win even at a low percentage
        assert_eq!(classify(&votes(51, 100, 0, 0)), WarningClass::Dangerous);
        assert_eq!(classify(&votes(0, 0, 0, 0)), WarningClass::Clear);
    }

    #[test]
    fn test_report_from_completed_analysis() {
        let body = r#"{
            "data": {
                "id": "abc==",
                "type": "analysis",
                "attributes": {
                    "status": "completed",
                    "stats": {
                        "malicious": 55,
                        "harmless": 0,
                        "suspicious": 2,
                        "undetected": 13,
                        "timeout": 1
                    }
                }
            },
            "meta": {"file_info": {"sha256": "deadbeef", "size": 42}}
        }"#;
        let analysis: AnalysisResponse = serde_json::from_str(body).unwrap();
        let report = report_from_analysis(&ScanTarget::new("/tmp/x.bin"), "abc==", analysis);

        assert_eq!(report.warning(), WarningClass::Dangerous);
        assert!(report.threat_detected());
        assert_eq!(report.analysis_id(), Some("abc=="));
        assert_eq!(report.sha256(), Some("deadbeef"));
        assert_eq!(report.votes().total(), 70);
        assert!(report.details().starts_with("55/70"));
    }

    #[test]
    fn test_report_from_huge_vote_counts() {
        let body = r#"{
            "data": {
                "attributes": {
                    "status": "completed",
                    "stats": {"malicious": 4294967295, "harmless": 1}
                }
            }
        }"#;
        let analysis: AnalysisResponse = serde_json::from_str(body).unwrap();
        let report = report_from_analysis(&ScanTarget::new("/tmp/x.bin"), "abc==", analysis);

        assert_eq!(report.warning(), WarningClass::Dangerous);
        assert_eq!(report.votes().total(), 4_294_967_296);
        assert!(report.is_valid());
    }

    #[test]
    fn test_queued_analysis_parses_without_stats() {
        let body = r#"{"data": {"attributes": {"status": "queued"}}}"#;
        let analysis: AnalysisResponse = serde_json::from_str(body).unwrap();
        assert_eq!(analysis.data.attributes.status, "queued");
        assert!(analysis.meta.is_none());
    }

    #[test]
    fn test_missing_api_key_is_invalid_and_not_recorded() {
        let limiter = Arc::new(RateLimiter::default());
        let engine = RemoteEngine::new(RemoteEngineConfig::default(), limiter.clone()).unwrap();
        assert_eq!(engine.name(), "remote");

        let report = engine.analyze(&ScanTarget::new("/tmp/whatever.bin"));
        assert!(!report.is_valid());
        assert_eq!(report.warning(), WarningClass::Clear);
        assert_eq!(limiter.recorded(), 0);
        assert_eq!(engine.last_report(), Some(report));
    }

    #[test]
    fn test_unreachable_service_is_invalid() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let limiter = Arc::new(RateLimiter::default());
        let config = RemoteEngineConfig {
            api_key: Some("key".to_string()),
            // Port 9 (discard) on loopback: connection refused
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout_secs: 2,
            ..RemoteEngineConfig::default()
        };
        let engine = RemoteEngine::new(config, limiter.clone()).unwrap();

        let report = engine.analyze(&ScanTarget::new(file.path()));
        assert!(!report.is_valid());
        assert_eq!(limiter.recorded(), 0);
    }
}
