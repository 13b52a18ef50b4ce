//! Daemon assembly: base directory, config, orphan cleanup, health loop,
//! control socket, teardown.

use crate::home::AgoHome;
use crate::process::ProcessManager;
use crate::router::MessageRouter;
use crate::server::ControlServer;
use ago_config::ConfigStore;
use ago_core::{AgoError, AgoResult};
use ago_registry::{HttpTemplateFetcher, TemplateFetcher, TemplateRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{info, warn};

/// Everything the request handlers share.
pub struct DaemonState {
    pub home: AgoHome,
    pub config: ConfigStore,
    pub manager: Arc<ProcessManager>,
    pub router: Arc<MessageRouter>,
    pub fetcher: Box<dyn TemplateFetcher>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl DaemonState {
    /// The registry is rebuilt per use so `config set` changes to the
    /// resolution order apply without a restart.
    pub fn templates(&self) -> TemplateRegistry {
        TemplateRegistry::new(
            self.home.layer_paths(),
            &self.config.template_resolution_order(),
        )
    }
}

pub struct Daemon {
    home: AgoHome,
}

impl Daemon {
    pub fn new(home: AgoHome) -> Self {
        Self { home }
    }

    pub async fn run(self) -> AgoResult<()> {
        let socket_path = self.home.daemon_socket();

        // A connectable socket means another daemon owns this home.
        if UnixStream::connect(&socket_path).await.is_ok() {
            return Err(AgoError::AlreadyRunning("daemon".into()));
        }
        if socket_path.exists() {
            info!(path = %socket_path.display(), "removing stale daemon socket");
            let _ = std::fs::remove_file(&socket_path);
        }

        let config = ConfigStore::load(self.home.config_path(), AgoHome::project_config_path())?;
        let mut reload_rx = config.subscribe();

        let manager = Arc::new(ProcessManager::new(
            self.home.clone(),
            Duration::from_secs(config.grace_timeout_secs()),
            Duration::from_secs(config.kill_timeout_secs()),
        ));
        manager.cleanup_orphans().await?;

        let router = Arc::new(MessageRouter::new(
            self.home.clone(),
            config.queue_capacity(),
        ));
        for id in manager.live_ids().await {
            router.register_instance(&id).await;
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| AgoError::BindFailed(format!("{}: {e}", socket_path.display())))?;
        std::fs::write(self.home.daemon_pid_file(), std::process::id().to_string())?;
        info!(
            socket = %socket_path.display(),
            pid = std::process::id(),
            "daemon started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(DaemonState {
            home: self.home.clone(),
            config,
            manager: manager.clone(),
            router: router.clone(),
            fetcher: Box::new(HttpTemplateFetcher::new()),
            shutdown_tx,
        });

        // Health loop: probe every instance, reap two-strike misses.
        let health_interval = Duration::from_secs(state.config.health_interval_secs().max(1));
        let health_manager = manager.clone();
        let health_router = router.clone();
        let health_task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(health_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                for crashed in health_manager.health_check_round().await {
                    health_router.drop_instance(&crashed).await;
                }
            }
        });

        // Log config invalidations so operators can see reloads land.
        let reload_task = tokio::spawn(async move {
            while reload_rx.changed().await.is_ok() {
                info!("configuration reloaded");
            }
        });

        let served = ControlServer::run(state.clone(), listener, shutdown_rx).await;

        health_task.abort();
        reload_task.abort();

        info!("stopping all instances");
        let stopped = manager.stop_all().await;
        for id in &stopped {
            router.drop_instance(id).await;
        }
        if !stopped.is_empty() {
            info!(count = stopped.len(), "instances stopped");
        }

        if let Err(e) = std::fs::remove_file(&socket_path) {
            warn!(error = %e, "could not remove daemon socket");
        }
        let _ = std::fs::remove_file(self.home.daemon_pid_file());
        info!("daemon stopped");
        served
    }
}
