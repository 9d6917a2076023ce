//! replayd - Chat Replay Test Daemon
//!
//! Library components for the daemon process: the retry-wrapped API
//! client, the conversation runner, the execution controller, the result
//! sink, and the HTTP control plane.

pub mod client;
pub mod controller;
pub mod runner;
pub mod server;
pub mod sink;

use std::path::PathBuf;
use std::sync::Arc;

use controller::Controller;
use replay_core::{Config, StatusBoard};
use sink::Sink;
use tracing::{debug, info, warn};

/// Daemon configuration, resolved from the config file and CLI flags.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Replay configuration (API endpoint, retry policy, case file).
    pub replay: Config,
    /// Auth token for the HTTP API (optional).
    pub auth_token: Option<String>,
}

impl DaemonConfig {
    /// Resolve configuration: defaults, then the config file if present.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self, replay_core::config::ConfigError> {
        let replay = match config_path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        Ok(Self {
            replay,
            auth_token: std::env::var("REPLAYD_AUTH_TOKEN").ok(),
        })
    }
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    controller: Arc<Controller>,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: DaemonConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let sink = Sink::new(&config.replay.db_path).await?;
        sink.migrate_embedded().await?;

        let controller = Arc::new(Controller::new(
            config.replay.clone(),
            Arc::new(StatusBoard::new()),
            Arc::new(sink),
        ));

        Ok(Self { config, controller })
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Run the daemon: serve the HTTP control plane until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("replayd starting on port {}", self.config.replay.port);
        info!("database: {}", self.config.replay.db_path.display());
        info!("case file: {}", self.config.replay.cases_path.display());
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        server::start_server(
            Arc::clone(&self.controller),
            self.config.replay.port,
            self.config.auth_token.clone(),
        )
        .await
    }

    /// Stop any active run ahead of process exit.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        if let Err(e) = self.controller.stop() {
            // No active run is the common case at shutdown.
            debug!("no run to stop at shutdown: {}", e);
        } else {
            warn!("active run stopped by shutdown");
        }
    }
}
