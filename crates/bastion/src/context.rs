//! Composition root: builds every component once and wires them together.

use crate::config::AppConfig;
use anyhow::{Context, Result};
use bastion_guard::{
    ConnectionState, DownloadWatcher, FileSink, RunningState, Supervisor, Tunnel, TunnelOp,
    Watcher, WgQuickTunnel,
};
use bastion_scan::{LocalEngine, RateLimiter, RemoteEngine, ScanEngine, ScanPipeline};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Application context holding the single instance of each service.
pub struct AppContext {
    config: AppConfig,
    supervisor: Supervisor,
}

impl AppContext {
    /// Build the production wiring from configuration
    pub fn build(config: AppConfig) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(config.remote.requests_per_minute));
        let local: Arc<dyn ScanEngine> = Arc::new(LocalEngine::new(config.scan.local.clone()));

        let remote: Option<Arc<dyn ScanEngine>> = if config.remote.is_usable() {
            let engine = RemoteEngine::new(config.remote.clone(), limiter.clone())
                .context("Failed to create remote reputation engine")?;
            Some(Arc::new(engine) as Arc<dyn ScanEngine>)
        } else {
            info!("Remote reputation engine disabled (no API key or turned off)");
            None
        };

        let pipeline = Arc::new(ScanPipeline::new(
            local,
            remote,
            limiter,
            config.scan.pipeline.clone(),
        ));

        let sink_pipeline = pipeline.clone();
        let sink: FileSink = Arc::new(move |path: &Path| {
            sink_pipeline.submit(path);
        });
        let watcher: Arc<dyn Watcher> =
            Arc::new(DownloadWatcher::new(config.watcher.clone(), sink));
        let tunnel: Arc<dyn Tunnel> = Arc::new(WgQuickTunnel::new(config.tunnel.clone()));

        Ok(Self::with_services(config, pipeline, watcher, tunnel))
    }

    /// Wire already-built services
    pub fn with_services(
        config: AppConfig,
        pipeline: Arc<ScanPipeline>,
        watcher: Arc<dyn Watcher>,
        tunnel: Arc<dyn Tunnel>,
    ) -> Self {
        Self {
            config,
            supervisor: Supervisor::new(pipeline, watcher, tunnel),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Peer to use: the given one, else the configured default
    pub fn resolve_peer<'a>(&'a self, peer: Option<&'a str>) -> Option<&'a str> {
        peer.or(self.config.tunnel.default_peer.as_deref())
    }

    /// Bring up the tunnel, then scanning, watching and the guardian.
    pub fn protect(&self, peer: Option<&str>) -> Result<()> {
        let supervisor = &self.supervisor;
        supervisor
            .manage_tunnel(TunnelOp::Start, self.resolve_peer(peer))
            .context("Failed to start tunnel")?;
        supervisor.set_scan_service(RunningState::Up);
        supervisor
            .set_watcher_service(RunningState::Up)
            .context("Failed to start download watcher")?;
        if !supervisor.guardian_state().is_up() {
            supervisor.start_guardian().context("Failed to start guardian")?;
        }
        info!("Protection active");
        Ok(())
    }

    /// Stop everything: guardian first so it does not react to the teardown.
    pub fn shutdown(&self) {
        let supervisor = &self.supervisor;
        if supervisor.guardian_state().is_up() {
            supervisor.stop_guardian();
        }
        if supervisor.watcher_state().is_up() {
            if let Err(e) = supervisor.set_watcher_service(RunningState::Down) {
                error!("Failed to stop download watcher: {}", e);
            }
        }
        if supervisor.scan_state().is_up() {
            supervisor.set_scan_service(RunningState::Down);
        }
        if supervisor.tunnel_state() != ConnectionState::Disconnected {
            if let Err(e) = supervisor.manage_tunnel(TunnelOp::Stop, None) {
                error!("Failed to stop tunnel: {}", e);
            }
        }
        info!("All services stopped");
    }
}
