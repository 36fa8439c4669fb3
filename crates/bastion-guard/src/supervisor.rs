//! Service supervisor and guardian loop.
//!
//! # Guardian rules
//!
//! Every [`GUARDIAN_INTERVAL`] while the guardian is up:
//!
//! - Tunnel CONNECTED with the pipeline or the watcher DOWN: log an error,
//!   stop whichever of the two is still UP, then tear the tunnel down.
//! - Tunnel not CONNECTED (in progress counts as not connected): stop the
//!   watcher if UP and stop the pipeline if UP.
//!
//! Restoring protection after a cascade takes an explicit restart of all
//! three services.

use crate::state::{ConnectionState, GuardianState};
use crate::tunnel::{Tunnel, TunnelError};
use crate::watcher::{Watcher, WatcherError};
use bastion_scan::{RunningState, ScanPipeline, ScanReport};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Guardian loop cadence
pub const GUARDIAN_INTERVAL: Duration = Duration::from_millis(200);

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Unsupported tunnel operation: {0}")]
    UnsupportedTunnelOp(String),

    #[error("No peer given to start the tunnel")]
    MissingPeer,

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),

    #[error("Failed to spawn guardian thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// The two tunnel operations the supervisor performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOp {
    Start,
    Stop,
}

impl FromStr for TunnelOp {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" | "up" => Ok(TunnelOp::Start),
            "stop" | "down" => Ok(TunnelOp::Stop),
            other => {
                warn!("Rejecting unsupported tunnel operation '{}'", other);
                Err(SupervisorError::UnsupportedTunnelOp(other.to_string()))
            }
        }
    }
}

/// What one guardian iteration observed and did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardianVerdict {
    /// Tunnel connected, pipeline and watcher up
    Protected,
    /// Tunnel connected without full protection; everything was shut down
    Cascade,
    /// Tunnel not connected; running services were stopped
    Quiesced,
    /// Tunnel not connected and nothing was running
    Idle,
}

struct Inner {
    pipeline: Arc<ScanPipeline>,
    watcher: Arc<dyn Watcher>,
    tunnel: Arc<dyn Tunnel>,
    guardian_state: Mutex<GuardianState>,
}

struct GuardianHandle {
    thread: JoinHandle<()>,
    /// Dropping this wakes the loop out of its sleep
    interrupt: Sender<()>,
}

/// Single authority over the scan pipeline, the watcher and the tunnel.
pub struct Supervisor {
    inner: Arc<Inner>,
    guardian: Mutex<Option<GuardianHandle>>,
}

impl Supervisor {
    pub fn new(
        pipeline: Arc<ScanPipeline>,
        watcher: Arc<dyn Watcher>,
        tunnel: Arc<dyn Tunnel>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pipeline,
                watcher,
                tunnel,
                guardian_state: Mutex::new(GuardianState::Down),
            }),
            guardian: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Arc<ScanPipeline> {
        &self.inner.pipeline
    }

    pub fn scan_state(&self) -> RunningState {
        self.inner.pipeline.running_state()
    }

    pub fn watcher_state(&self) -> RunningState {
        self.inner.watcher.running_state()
    }

    pub fn tunnel_state(&self) -> ConnectionState {
        self.inner.tunnel.connection_state()
    }

    pub fn guardian_state(&self) -> GuardianState {
        self.inner.guardian_state()
    }

    /// Bring the scan pipeline to `desired` and return its reports so far.
    pub fn set_scan_service(&self, desired: RunningState) -> Vec<Arc<ScanReport>> {
        let pipeline = &self.inner.pipeline;
        match (desired, pipeline.running_state()) {
            (RunningState::Up, RunningState::Down) => pipeline.start(),
            (RunningState::Down, RunningState::Up) => pipeline.stop(),
            (_, current) => warn!("Scan service is already {}", current),
        }
        pipeline.results()
    }

    /// Bring the download watcher to `desired`.
    pub fn set_watcher_service(&self, desired: RunningState) -> Result<(), SupervisorError> {
        let watcher = &self.inner.watcher;
        match (desired, watcher.running_state()) {
            (RunningState::Up, RunningState::Down) => watcher.start()?,
            (RunningState::Down, RunningState::Up) => watcher.stop(),
            (_, current) => warn!("Watcher service is already {}", current),
        }
        Ok(())
    }

    /// Start or stop the tunnel. `peer` is required to start.
    pub fn manage_tunnel(&self, op: TunnelOp, peer: Option<&str>) -> Result<(), SupervisorError> {
        match op {
            TunnelOp::Start => {
                let peer = peer.ok_or(SupervisorError::MissingPeer)?;
                self.inner.tunnel.bring_up(peer)?;
                info!("Tunnel started for {}", peer);
            }
            TunnelOp::Stop => {
                self.inner.tunnel.tear_down()?;
                info!("Tunnel stopped");
            }
        }
        Ok(())
    }

    /// Launch the guardian loop. Warns and does nothing if it is already up.
    pub fn start_guardian(&self) -> Result<(), SupervisorError> {
        let mut guardian = self.guardian.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self
                .inner
                .guardian_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.is_up() {
                warn!("Guardian is already running");
                return Ok(());
            }
            *state = GuardianState::Up;
        }

        let (interrupt, interrupted) = bounded(0);
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("guardian".to_string())
            .spawn(move || {
                info!("Guardian started");
                inner.run_guardian(interrupted);
                info!("Guardian stopped");
            });

        match spawned {
            Ok(thread) => {
                *guardian = Some(GuardianHandle { thread, interrupt });
                Ok(())
            }
            Err(e) => {
                *self.inner.guardian_state.lock().unwrap_or_else(PoisonError::into_inner) =
                    GuardianState::Down;
                Err(SupervisorError::Spawn(e))
            }
        }
    }

    /// Ask the guardian loop to end and wait for it.
    ///
    /// The current iteration is not interrupted; the loop notices the
    /// request at its next state check, at most one interval later.
    pub fn stop_guardian(&self) {
        let mut guardian = self.guardian.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self
                .inner
                .guardian_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !state.is_up() {
                warn!("Guardian is already stopped");
                return;
            }
            *state = GuardianState::Down;
        }

        if let Some(handle) = guardian.take() {
            if handle.thread.join().is_err() {
                error!("Guardian thread panicked");
            }
            drop(handle.interrupt);
        }
    }

    /// Run one guardian iteration
    pub fn guardian_tick(&self) -> GuardianVerdict {
        self.inner.guardian_tick()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        *self
            .inner
            .guardian_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = GuardianState::Down;
        let handle = self.guardian.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            // Interrupt the sleep instead of waiting out the interval
            drop(handle.interrupt);
            if handle.thread.join().is_err() {
                error!("Guardian thread panicked");
            }
        }
    }
}

impl Inner {
    fn guardian_state(&self) -> GuardianState {
        *self.guardian_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_guardian(&self, interrupted: Receiver<()>) {
        while self.guardian_state().is_up() {
            self.guardian_tick();

            match interrupted.recv_timeout(GUARDIAN_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => {
                    debug!("Guardian interrupted");
                    break;
                }
            }
        }
    }

    fn guardian_tick(&self) -> GuardianVerdict {
        let tunnel = self.tunnel.connection_state();
        let scan = self.pipeline.running_state();
        let watcher = self.watcher.running_state();

        if tunnel.is_connected() {
            if scan.is_up() && watcher.is_up() {
                return GuardianVerdict::Protected;
            }

            error!(
                "Tunnel connected without protection (scan {}, watcher {}); shutting down",
                scan, watcher
            );
            if watcher.is_up() {
                self.watcher.stop();
            }
            if scan.is_up() {
                self.pipeline.stop();
            }
            if let Err(e) = self.tunnel.tear_down() {
                error!("Failed to tear down tunnel: {}", e);
            }
            return GuardianVerdict::Cascade;
        }

        let mut stopped = false;
        if watcher.is_up() {
            info!("Tunnel is {}; stopping download watcher", tunnel);
            self.watcher.stop();
            stopped = true;
        }
        if scan.is_up() {
            info!("Tunnel is {}; stopping scan service", tunnel);
            self.pipeline.stop();
            stopped = true;
        }

        if stopped {
            GuardianVerdict::Quiesced
        } else {
            GuardianVerdict::Idle
        }
    }
}
