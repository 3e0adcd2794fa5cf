pub mod adapters;
pub mod app;
pub mod config;
pub mod domain;
pub mod ports;
pub mod telemetry;

use crate::adapters::{GithubReleases, PlexSessions, ProcNetDev, QbittorrentClient};
use crate::app::arbitration::DEFAULT_TICK_INTERVAL;
use crate::app::{
    ApiCollaborator, ArbitrationLoop, DaemonHooks, MediaDetector, NetDetector, ReleaseWatcher,
    ServerConfig, StateBroadcastServer, Supervisor,
};
use crate::config::InhibitorConfig;
use crate::domain::inhibit::InhibitHolder;
use anyhow::Context;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command-line overrides layered on top of the config file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: Option<PathBuf>,
    pub api_address: Option<IpAddr>,
    pub api_port: Option<u16>,
    pub api_alt_port: Option<u16>,
    pub tick_interval: Duration,
    pub otlp_endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: None,
            api_address: None,
            api_port: None,
            api_alt_port: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            otlp_endpoint: None,
        }
    }
}

impl Settings {
    pub fn server_config(&self, config: &InhibitorConfig) -> ServerConfig {
        ServerConfig {
            address: self.api_address.unwrap_or(config.api_ip),
            port: self.api_port.unwrap_or(config.api_port),
            alt_port: self.api_alt_port.unwrap_or(config.api_alt_port),
            ..ServerConfig::default()
        }
    }
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let config_path = InhibitorConfig::locate(settings.config_path.as_deref())?;
    let config = InhibitorConfig::load(&config_path)?;
    info!(path = %config_path.display(), version = VERSION, "Configuration loaded");

    let (metrics, provider) = if let Some(ref endpoint) = settings.otlp_endpoint {
        let (provider, metrics) = telemetry::init_metrics(endpoint, "qbt-inhibitord")?;
        (Some(Arc::new(metrics)), Some(provider))
    } else {
        (None, None)
    };

    let stop = CancellationToken::new();
    let holder = Arc::new(InhibitHolder::new());

    let target = Arc::new(
        QbittorrentClient::new(&config.qbt_url, &config.qbt_user, &config.qbt_password)
            .context("creating qBittorrent client")?,
    );
    let arbitration =
        ArbitrationLoop::new(Arc::clone(&holder), target).with_metrics(metrics.clone());
    let hooks = Arc::new(DaemonHooks::new(
        Arc::clone(&holder),
        stop.clone(),
        arbitration.subscribe_phase(),
    ));
    let server = Arc::new(
        StateBroadcastServer::new(
            settings.server_config(&config),
            Arc::clone(&holder),
            hooks.clone(),
        )
        .with_metrics(metrics.clone()),
    );

    let mut supervisor =
        Supervisor::new(Arc::clone(&holder), stop.clone()).with_metrics(metrics.clone());
    supervisor.spawn(Arc::new(ApiCollaborator::new(Arc::clone(&server), VERSION)));
    match (&config.plex_url, &config.plex_token) {
        (Some(url), Some(token)) => {
            let probe = PlexSessions::new(url, token).context("creating Plex client")?;
            supervisor.spawn(Arc::new(MediaDetector::new(probe)));
        }
        _ => info!("Plex not configured, media detection disabled"),
    }
    match &config.net_interface {
        Some(interface) => supervisor.spawn(Arc::new(NetDetector::new(
            ProcNetDev::default(),
            interface.clone(),
            config.net_threshold_mbit,
        ))),
        None => info!("No network interface configured, saturation detection disabled"),
    }

    let arbitration_task = tokio::spawn(arbitration.run(stop.clone(), settings.tick_interval));

    let release_task = match (&config.release_repo, config.release_check) {
        (Some(repo), true) => {
            let feed = GithubReleases::new(repo)?;
            let watcher = ReleaseWatcher::new(feed, VERSION);
            Some(tokio::spawn(watcher.run(Arc::clone(&server), stop.clone())))
        }
        _ => None,
    };

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = stop.cancelled() => {}
    }

    supervisor.shutdown().await;
    if let Err(err) = arbitration_task.await {
        warn!(error = %err, "Arbitration task ended abnormally");
    }
    if let Some(task) = release_task {
        let _ = task.await;
    }

    if let Some(provider) = provider {
        telemetry::shutdown_metrics(provider)?;
    }
    if hooks.restart_requested() {
        info!("Exiting for restart");
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = ctrl_c().await;
    info!("Shutdown signal received");
}
