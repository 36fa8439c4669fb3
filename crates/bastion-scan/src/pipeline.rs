//! Scan pipeline: deduplicating FIFO queue plus one worker thread.
//!
//! Producers call [`ScanPipeline::submit`] from any thread. The worker sleeps
//! on a condition variable while the queue is empty and is woken by every
//! successful submission and by [`ScanPipeline::stop`].

use crate::config::PipelineConfig;
use crate::engine::ScanEngine;
use crate::rate_limiter::RateLimiter;
use crate::report::{ScanReport, ScanTarget};
use crate::warning::RunningState;
use std::collections::VecDeque;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Queue contents and the running flag share one lock so the worker can
/// check both atomically before it waits.
struct QueueState {
    pending: VecDeque<ScanTarget>,
    running: RunningState,
}

struct Shared {
    queue: Mutex<QueueState>,
    wakeup: Condvar,
    results: Mutex<Vec<Arc<ScanReport>>>,
    /// Files classified as threats, kept for later remediation
    flagged: Mutex<Vec<ScanTarget>>,
    local: Arc<dyn ScanEngine>,
    remote: Option<Arc<dyn ScanEngine>>,
    limiter: Arc<RateLimiter>,
    config: PipelineConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Queue + worker that turns submitted files into final scan reports.
pub struct ScanPipeline {
    shared: Arc<Shared>,
    /// Worker handle; also serializes `start`/`stop`
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScanPipeline {
    /// Create a stopped pipeline.
    ///
    /// `remote` is optional; without it only the local engine runs. The
    /// limiter must be the same instance the remote engine records into.
    pub fn new(
        local: Arc<dyn ScanEngine>,
        remote: Option<Arc<dyn ScanEngine>>,
        limiter: Arc<RateLimiter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    running: RunningState::Down,
                }),
                wakeup: Condvar::new(),
                results: Mutex::new(Vec::new()),
                flagged: Mutex::new(Vec::new()),
                local,
                remote,
                limiter,
                config,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Queue a file for scanning.
    ///
    /// Paths that do not exist are logged and ignored. A path already waiting
    /// in the queue is not added twice. Returns whether the file was queued.
    pub fn submit(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            warn!("Ignoring scan request with an empty path");
            return false;
        }

        let target = ScanTarget::new(path);
        if !target.exists() {
            warn!("Ignoring scan request for missing file {}", target);
            return false;
        }

        let mut queue = lock(&self.shared.queue);
        if queue.pending.contains(&target) {
            debug!("{} is already queued", target);
            return false;
        }

        debug!("Queued {} for scanning", target);
        queue.pending.push_back(target);
        drop(queue);

        self.shared.wakeup.notify_one();
        true
    }

    /// Start the worker thread. Warns and does nothing if already running.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);

        {
            let mut queue = lock(&self.shared.queue);
            if queue.running.is_up() {
                warn!("Scan pipeline is already running");
                return;
            }
            queue.running = RunningState::Up;
        }

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("scan-worker".to_string())
            .spawn(move || {
                info!("Scan worker started");
                shared.run_worker();
                info!("Scan worker stopped");
            });

        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                error!("Failed to spawn scan worker: {}", e);
                lock(&self.shared.queue).running = RunningState::Down;
            }
        }
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// A file being scanned is finished first; files still queued stay
    /// queued for the next `start`. Warns and does nothing if already stopped.
    pub fn stop(&self) {
        let mut worker = lock(&self.worker);

        {
            let mut queue = lock(&self.shared.queue);
            if queue.running.is_down() {
                warn!("Scan pipeline is already stopped");
                return;
            }
            queue.running = RunningState::Down;
        }
        self.shared.wakeup.notify_all();

        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("Scan worker exited with a panic");
            }
        }
    }

    pub fn running_state(&self) -> RunningState {
        lock(&self.shared.queue).running
    }

    /// Snapshot of all finalized reports
    pub fn results(&self) -> Vec<Arc<ScanReport>> {
        lock(&self.shared.results).clone()
    }

    /// Snapshot of files waiting to be scanned
    pub fn pending(&self) -> Vec<ScanTarget> {
        lock(&self.shared.queue).pending.iter().cloned().collect()
    }

    /// Snapshot of files classified suspicious or dangerous
    pub fn flagged(&self) -> Vec<ScanTarget> {
        lock(&self.shared.flagged).clone()
    }
}

impl Drop for ScanPipeline {
    fn drop(&mut self) {
        if self.running_state().is_up() {
            self.stop();
        }
    }
}

impl Shared {
    fn run_worker(&self) {
        while let Some(target) = self.next_target() {
            // An engine panic must not take the worker down with it
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.scan(&target)));
            let report = outcome.unwrap_or_else(|panic_info| {
                let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                error!("Scan of {} panicked: {}", target, message);
                ScanReport::invalid(target.clone(), format!("Scan aborted: {}", message))
            });
            self.finalize(report);
        }
    }

    /// Block until a file is available; `None` once the pipeline is stopped.
    fn next_target(&self) -> Option<ScanTarget> {
        let mut queue = lock(&self.queue);
        loop {
            if queue.running.is_down() {
                return None;
            }
            if let Some(target) = queue.pending.pop_front() {
                return Some(target);
            }
            queue = self
                .wakeup
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn scan(&self, target: &ScanTarget) -> ScanReport {
        debug!("Scanning {}", target);
        let mut report = ScanReport::new(target.clone());

        debug!("Running {} engine on {}", self.local.name(), target.name());
        let local = self.local.analyze(target);
        report.merge(Some(&local));

        if report.threat_detected() {
            if let Some(remote) = &self.remote {
                self.consult_remote(remote.as_ref(), target, &mut report);
            }
        }

        report
    }

    /// Run the remote engine if the size ceiling and the rate limiter allow it
    fn consult_remote(
        &self,
        remote: &dyn ScanEngine,
        target: &ScanTarget,
        report: &mut ScanReport,
    ) {
        let size = match fs::metadata(target.path()) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Cannot size {} for reputation check: {}", target, e);
                return;
            }
        };

        if size > self.config.remote_size_limit {
            info!(
                "Not sending {} for reputation check: {} bytes exceeds the {} byte limit",
                target.name(),
                size,
                self.config.remote_size_limit
            );
            return;
        }

        if !self.limiter.admit() {
            info!(
                "{} engine check for {} skipped: rate limit reached",
                remote.name(),
                target.name()
            );
            report.annotate("reputation check skipped (rate limit reached)");
            return;
        }

        debug!("Running {} engine on {}", remote.name(), target.name());
        let remote_report = remote.analyze(target);
        report.merge(Some(&remote_report));
    }

    fn finalize(&self, report: ScanReport) {
        if report.warning().is_threat() {
            warn!("Threat found: {}", report);
            lock(&self.flagged).push(report.target().clone());
        } else {
            info!("Scanned {}", report);
        }
        lock(&self.results).push(Arc::new(report));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::EngineVotes;
    use crate::warning::WarningClass;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    /// Engine returning a fixed verdict, optionally after a delay
    struct FakeEngine {
        warning: WarningClass,
        valid: bool,
        delay: Duration,
        calls: AtomicUsize,
        limiter: Option<Arc<RateLimiter>>,
        last: Mutex<Option<ScanReport>>,
    }

    impl FakeEngine {
        fn new(warning: WarningClass) -> Self {
            Self {
                warning,
                valid: true,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                limiter: None,
                last: Mutex::new(None),
            }
        }

        fn failing() -> Self {
            Self {
                valid: false,
                ..Self::new(WarningClass::Clear)
            }
        }

        fn slow(warning: WarningClass, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(warning)
            }
        }

        /// Records into `limiter` like the real remote engine does
        fn recording(warning: WarningClass, limiter: Arc<RateLimiter>) -> Self {
            Self {
                limiter: Some(limiter),
                ..Self::new(warning)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ScanEngine for FakeEngine {
        fn name(&self) -> &str {
            "fake"
        }

        fn analyze(&self, target: &ScanTarget) -> ScanReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if let Some(limiter) = &self.limiter {
                limiter.record();
            }

            let report = if self.valid {
                let mut report = ScanReport::new(target.clone());
                report.set_verdict(self.warning, format!("fake verdict {}", self.warning));
                if self.warning.is_threat() {
                    report.set_votes(EngineVotes { malicious: 3, ..EngineVotes::default() });
                }
                report
            } else {
                ScanReport::invalid(target.clone(), "fake failure")
            };
            *self.last.lock().unwrap() = Some(report.clone());
            report
        }

        fn last_report(&self) -> Option<ScanReport> {
            self.last.lock().unwrap().clone()
        }
    }

    fn write_file(dir: &TempDir, name: &str, len: usize) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![b'x'; len]).unwrap();
        path
    }

    fn pipeline(
        local: Arc<FakeEngine>,
        remote: Option<Arc<FakeEngine>>,
        limiter: Arc<RateLimiter>,
        config: PipelineConfig,
    ) -> ScanPipeline {
        ScanPipeline::new(
            local,
            remote.map(|r| r as Arc<dyn ScanEngine>),
            limiter,
            config,
        )
    }

    fn simple(local: WarningClass) -> ScanPipeline {
        pipeline(
            Arc::new(FakeEngine::new(local)),
            None,
            Arc::new(RateLimiter::default()),
            PipelineConfig::default(),
        )
    }

    fn wait_for_results(pipeline: &ScanPipeline, count: usize) -> Vec<Arc<ScanReport>> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let results = pipeline.results();
            if results.len() >= count || Instant::now() > deadline {
                return results;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_submit_dedups_pending() {
        let dir = TempDir::new().unwrap();
        let file = write_file(&dir, "a.bin", 4);
        let pipeline = simple(WarningClass::Clear);

        assert!(pipeline.submit(&file));
        assert!(!pipeline.submit(&file));
        assert_eq!(pipeline.pending().len(), 1);
        assert_eq!(pipeline.pending()[0].path(), file.as_path());
    }

    #[test]
    fn test_submit_rejects_missing_paths() {
        let dir = TempDir::new().unwrap();
        let pipeline = simple(WarningClass::Clear);

        assert!(!pipeline.submit(""));
        assert!(!pipeline.submit(dir.path().join("gone.bin")));
        assert!(pipeline.pending().is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let dir = TempDir::new().unwrap();
        let first = write_file(&dir, "1.bin", 1);
        let second = write_file(&dir, "2.bin", 1);
        let pipeline = simple(WarningClass::Clear);

        pipeline.submit(&first);
        pipeline.submit(&second);
        pipeline.start();

        let results = wait_for_results(&pipeline, 2);
        pipeline.stop();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].target().path(), first.as_path());
        assert_eq!(results[1].target().path(), second.as_path());
    }

    #[test]
    fn test_start_twice_runs_one_worker() {
        let dir = TempDir::new().unwrap();
        let pipeline = simple(WarningClass::Clear);

        pipeline.start();
        pipeline.start();
        assert_eq!(pipeline.running_state(), RunningState::Up);

        // A single stop must leave no worker behind
        pipeline.stop();
        assert_eq!(pipeline.running_state(), RunningState::Down);

        let file = write_file(&dir, "late.bin", 1);
        pipeline.submit(&file);
        thread::sleep(Duration::from_millis(50));
        assert!(pipeline.results().is_empty());
        assert_eq!(pipeline.pending().len(), 1);
    }

    #[test]
    fn test_stop_twice() {
        let pipeline = simple(WarningClass::Clear);
        pipeline.stop();
        pipeline.start();
        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.running_state(), RunningState::Down);
    }

    #[test]
    fn test_idle_worker_wakes_on_submit() {
        let dir = TempDir::new().unwrap();
        let pipeline = simple(WarningClass::Clear);
        pipeline.start();
        thread::sleep(Duration::from_millis(20));

        pipeline.submit(write_file(&dir, "wake.bin", 1));
        assert_eq!(wait_for_results(&pipeline, 1).len(), 1);
        pipeline.stop();
    }

    #[test]
    fn test_stop_finishes_in_flight_file() {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(FakeEngine::slow(WarningClass::Clear, Duration::from_millis(100)));
        let pipeline = pipeline(
            local.clone(),
            None,
            Arc::new(RateLimiter::default()),
            PipelineConfig::default(),
        );

        pipeline.submit(write_file(&dir, "slow.bin", 1));
        pipeline.start();
        while local.calls() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        pipeline.stop();
        assert_eq!(pipeline.results().len(), 1);
    }

    #[test]
    fn test_dangerous_file_consults_remote() {
        let dir = TempDir::new().unwrap();
        let limiter = Arc::new(RateLimiter::default());
        let local = Arc::new(FakeEngine::new(WarningClass::Suspicious));
        let remote = Arc::new(FakeEngine::recording(WarningClass::Dangerous, limiter.clone()));
        let pipeline = pipeline(
            local,
            Some(remote.clone()),
            limiter.clone(),
            PipelineConfig::default(),
        );

        pipeline.submit(write_file(&dir, "evil.exe", 16));
        pipeline.start();
        let results = wait_for_results(&pipeline, 1);
        pipeline.stop();

        assert_eq!(remote.calls(), 1);
        assert_eq!(limiter.recorded(), 1);
        let report = &results[0];
        assert_eq!(report.warning(), WarningClass::Dangerous);
        assert!(report.threat_detected());
        assert!(report.is_valid());
        assert_eq!(report.votes().malicious, 6);
        assert_eq!(pipeline.flagged().len(), 1);
    }

    #[test]
    fn test_remote_cannot_lower_local_verdict() {
        let dir = TempDir::new().unwrap();
        let limiter = Arc::new(RateLimiter::default());
        let local = Arc::new(FakeEngine::new(WarningClass::Dangerous));
        let remote = Arc::new(FakeEngine::new(WarningClass::Clear));
        let pipeline = pipeline(local, Some(remote.clone()), limiter, PipelineConfig::default());

        pipeline.submit(write_file(&dir, "evil.exe", 16));
        pipeline.start();
        let results = wait_for_results(&pipeline, 1);
        pipeline.stop();

        assert_eq!(remote.calls(), 1);
        assert_eq!(results[0].warning(), WarningClass::Dangerous);
        assert_eq!(results[0].details(), "fake verdict DANGEROUS");
    }

    #[test]
    fn test_oversized_file_skips_remote() {
        let dir = TempDir::new().unwrap();
        let limiter = Arc::new(RateLimiter::default());
        let local = Arc::new(FakeEngine::new(WarningClass::Dangerous));
        let remote = Arc::new(FakeEngine::recording(WarningClass::Dangerous, limiter.clone()));
        let config = PipelineConfig { remote_size_limit: 8 };
        let pipeline = pipeline(local, Some(remote.clone()), limiter.clone(), config);

        pipeline.submit(write_file(&dir, "big.iso", 64));
        pipeline.start();
        let results = wait_for_results(&pipeline, 1);
        pipeline.stop();

        assert_eq!(remote.calls(), 0);
        assert_eq!(limiter.recorded(), 0);
        assert_eq!(results[0].warning(), WarningClass::Dangerous);
        assert!(results[0].is_valid());
    }

    #[test]
    fn test_rate_limited_file_skips_remote() {
        let dir = TempDir::new().unwrap();
        let limiter = Arc::new(RateLimiter::new(1));
        limiter.record();
        let local = Arc::new(FakeEngine::new(WarningClass::Suspicious));
        let remote = Arc::new(FakeEngine::new(WarningClass::Dangerous));
        let pipeline = pipeline(local, Some(remote.clone()), limiter, PipelineConfig::default());

        pipeline.submit(write_file(&dir, "x.bin", 4));
        pipeline.start();
        let results = wait_for_results(&pipeline, 1);
        pipeline.stop();

        assert_eq!(remote.calls(), 0);
        assert_eq!(results[0].warning(), WarningClass::Suspicious);
        assert!(results[0].details().contains("rate limit"));
    }

    #[test]
    fn test_clean_file_skips_remote() {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(FakeEngine::new(WarningClass::Clear));
        let remote = Arc::new(FakeEngine::new(WarningClass::Dangerous));
        let pipeline = pipeline(
            local,
            Some(remote.clone()),
            Arc::new(RateLimiter::default()),
            PipelineConfig::default(),
        );

        pipeline.submit(write_file(&dir, "doc.pdf", 4));
        pipeline.start();
        let results = wait_for_results(&pipeline, 1);
        pipeline.stop();

        assert_eq!(remote.calls(), 0);
        assert!(!results[0].threat_detected());
        assert!(pipeline.flagged().is_empty());
    }

    #[test]
    fn test_local_failure_does_not_stall_worker() {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(FakeEngine::failing());
        let pipeline = pipeline(
            local.clone(),
            None,
            Arc::new(RateLimiter::default()),
            PipelineConfig::default(),
        );

        pipeline.submit(write_file(&dir, "1.bin", 1));
        pipeline.submit(write_file(&dir, "2.bin", 1));
        pipeline.start();
        let results = wait_for_results(&pipeline, 2);
        pipeline.stop();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_valid()));
        assert!(results.iter().all(|r| r.warning() == WarningClass::Clear));
    }

    #[test]
    fn test_remote_failure_degrades_validity_only() {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(FakeEngine::new(WarningClass::Dangerous));
        let remote = Arc::new(FakeEngine::failing());
        let pipeline = pipeline(
            local,
            Some(remote),
            Arc::new(RateLimiter::default()),
            PipelineConfig::default(),
        );

        pipeline.submit(write_file(&dir, "x.bin", 1));
        pipeline.start();
        let results = wait_for_results(&pipeline, 1);
        pipeline.stop();

        assert!(!results[0].is_valid());
        assert_eq!(results[0].warning(), WarningClass::Dangerous);
    }

    #[test]
    fn test_results_are_snapshots() {
        let dir = TempDir::new().unwrap();
        let pipeline = simple(WarningClass::Clear);
        let before = pipeline.results();

        pipeline.submit(write_file(&dir, "x.bin", 1));
        pipeline.start();
        wait_for_results(&pipeline, 1);
        pipeline.stop();

        assert!(before.is_empty());
        assert_eq!(pipeline.results().len(), 1);
    }

    #[test]
    fn test_concurrent_producers() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<_> = (0..8).map(|i| write_file(&dir, &format!("{i}.bin"), 1)).collect();
        let pipeline = Arc::new(simple(WarningClass::Clear));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let pipeline = pipeline.clone();
                let paths = paths.clone();
                thread::spawn(move || {
                    for path in &paths {
                        pipeline.submit(path);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(pipeline.pending().len(), 8);
    }
}
