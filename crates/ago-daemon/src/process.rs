//! Worker process lifecycle: spawn, health-check, stop, reap.

use crate::home::AgoHome;
use crate::registry_file::{pid_alive, RegistryFile};
use ago_core::{
    read_frame, write_frame, AgoError, AgoResult, InstanceDetail, InstanceId, InstanceRecord,
    InstanceState, InstanceSummary, WorkerReply, WorkerRequest,
};
use ago_registry::Template;
use ago_worker::{ToolServerConfig, WorkerBootstrap};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const READY_WAIT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_MISS_LIMIT: u32 = 2;

struct ChildHandle {
    record: InstanceRecord,
    template: Option<Template>,
    /// `None` for workers re-adopted from a previous daemon generation;
    /// those are controlled by PID signals only.
    child: Option<Child>,
    health_misses: u32,
}

pub struct ProcessManager {
    home: AgoHome,
    registry: RegistryFile,
    instances: RwLock<HashMap<String, ChildHandle>>,
    grace_timeout: Duration,
    kill_timeout: Duration,
}

/// Probe an instance socket with a `Ping` frame.
pub async fn ping_instance(socket: &Path, timeout: Duration) -> AgoResult<InstanceState> {
    let probe = async {
        let mut stream = UnixStream::connect(socket).await?;
        write_frame(&mut stream, &WorkerRequest::Ping).await?;
        match read_frame::<_, WorkerReply>(&mut stream).await? {
            Some(WorkerReply::Pong { state }) => Ok(state),
            other => Err(AgoError::DecodeFailure(format!(
                "unexpected ping reply: {other:?}"
            ))),
        }
    };
    match tokio::time::timeout(timeout, probe).await {
        Ok(result) => result,
        Err(_) => Err(AgoError::SocketIo(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "ping timed out",
        ))),
    }
}

fn worker_binary() -> PathBuf {
    if let Some(path) = std::env::var_os("AGO_WORKER_BIN") {
        return path.into();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("ago-worker")))
        .unwrap_or_else(|| PathBuf::from("ago-worker"))
}

impl ProcessManager {
    pub fn new(home: AgoHome, grace_timeout: Duration, kill_timeout: Duration) -> Self {
        let registry = RegistryFile::new(home.registry_file());
        Self {
            home,
            registry,
            instances: RwLock::new(HashMap::new()),
            grace_timeout,
            kill_timeout,
        }
    }

    /// Spawn a worker for `template` and wait until it registers as
    /// `Ready` (or dies trying).
    pub async fn spawn(
        &self,
        template: Template,
        model: String,
        limits: ago_config::WorkerLimits,
        tool_servers: Vec<ToolServerConfig>,
    ) -> AgoResult<InstanceId> {
        let instance_id = loop {
            let candidate = InstanceId::mint(&template.name);
            if !self
                .instances
                .read()
                .await
                .contains_key(candidate.as_str())
            {
                break candidate;
            }
        };

        let socket_path = self.home.instance_socket(&instance_id);
        let log_path = self.home.instance_log(&instance_id);
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }

        let agent_network = self.live_ids().await.iter().map(|id| id.to_string()).collect();
        let boot = WorkerBootstrap {
            instance_id: instance_id.clone(),
            template: template.clone(),
            model: model.clone(),
            limits,
            tool_servers,
            agent_network,
            socket_path: socket_path.clone(),
            daemon_socket_path: self.home.daemon_socket(),
        };
        let handshake = serde_json::to_string(&boot)?;

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| AgoError::SpawnFailed(format!("log file {}: {e}", log_path.display())))?;
        let log_for_stderr = log_file
            .try_clone()
            .map_err(|e| AgoError::SpawnFailed(e.to_string()))?;

        let child = Command::new(worker_binary())
            .arg(handshake)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::from(log_file))
            .stderr(std::process::Stdio::from(log_for_stderr))
            .spawn()
            .map_err(|e| AgoError::SpawnFailed(format!("{}: {e}", worker_binary().display())))?;

        let pid = child
            .id()
            .ok_or_else(|| AgoError::SpawnFailed("worker exited before it was tracked".into()))?;

        info!(instance = %instance_id, pid, "spawned worker");

        let record = InstanceRecord {
            instance_id: instance_id.clone(),
            template: template.name.clone(),
            model,
            pid,
            socket_path,
            log_path,
            state: InstanceState::Starting,
            spawned_at: Utc::now(),
        };
        self.registry.upsert(record.clone())?;
        self.instances.write().await.insert(
            instance_id.to_string(),
            ChildHandle {
                record,
                template: Some(template),
                child: Some(child),
                health_misses: 0,
            },
        );

        self.wait_until_ready(&instance_id).await
    }

    async fn wait_until_ready(&self, instance_id: &InstanceId) -> AgoResult<InstanceId> {
        let started = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;

            let mut instances = self.instances.write().await;
            let Some(handle) = instances.get_mut(instance_id.as_str()) else {
                return Err(AgoError::SpawnFailed(format!(
                    "{instance_id} disappeared while starting"
                )));
            };

            if handle.record.state == InstanceState::Ready {
                return Ok(instance_id.clone());
            }

            let exited = match handle.child.as_mut() {
                Some(child) => child.try_wait().ok().flatten().is_some(),
                None => !pid_alive(handle.record.pid),
            };
            if exited {
                let log_path = handle.record.log_path.clone();
                instances.remove(instance_id.as_str());
                drop(instances);
                let _ = self.registry.remove(instance_id);
                let _ = std::fs::remove_file(self.home.instance_socket(instance_id));
                return Err(AgoError::SpawnFailed(format!(
                    "worker exited during startup, see {}",
                    log_path.display()
                )));
            }
            drop(instances);

            if started.elapsed() > READY_WAIT {
                warn!(instance = %instance_id, "worker did not become ready in time");
                let _ = self.stop(instance_id).await;
                return Err(AgoError::SpawnFailed(format!(
                    "{instance_id} did not become ready within {}s",
                    READY_WAIT.as_secs()
                )));
            }
        }
    }

    /// Called when the worker announces itself on the control socket.
    pub async fn mark_ready(&self, instance_id: &InstanceId) -> AgoResult<()> {
        let mut instances = self.instances.write().await;
        let handle = instances
            .get_mut(instance_id.as_str())
            .ok_or_else(|| AgoError::NoSuchAgent(instance_id.to_string()))?;
        handle.record.state = InstanceState::Ready;
        drop(instances);
        self.registry.set_state(instance_id, InstanceState::Ready)?;
        info!(instance = %instance_id, "instance ready");
        Ok(())
    }

    pub async fn live_ids(&self) -> Vec<InstanceId> {
        self.instances
            .read()
            .await
            .values()
            .map(|handle| handle.record.instance_id.clone())
            .collect()
    }

    pub async fn list(&self) -> Vec<InstanceSummary> {
        let instances = self.instances.read().await;
        let mut summaries: Vec<InstanceSummary> = instances
            .values()
            .map(|handle| InstanceSummary {
                instance_id: handle.record.instance_id.clone(),
                template: handle.record.template.clone(),
                model: handle.record.model.clone(),
                state: handle.record.state,
                pid: handle.record.pid,
                spawned_at: handle.record.spawned_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.spawned_at.cmp(&b.spawned_at));
        summaries
    }

    pub async fn detail(&self, instance_id: &InstanceId) -> AgoResult<InstanceDetail> {
        let instances = self.instances.read().await;
        let handle = instances
            .get(instance_id.as_str())
            .ok_or_else(|| AgoError::NoSuchAgent(instance_id.to_string()))?;
        Ok(InstanceDetail {
            summary: InstanceSummary {
                instance_id: handle.record.instance_id.clone(),
                template: handle.record.template.clone(),
                model: handle.record.model.clone(),
                state: handle.record.state,
                pid: handle.record.pid,
                spawned_at: handle.record.spawned_at,
            },
            socket_path: handle.record.socket_path.display().to_string(),
            log_path: handle.record.log_path.display().to_string(),
            tools: handle
                .template
                .as_ref()
                .map(|t| t.tools.clone())
                .unwrap_or_default(),
        })
    }

    pub async fn socket_for(&self, instance_id: &InstanceId) -> AgoResult<PathBuf> {
        let instances = self.instances.read().await;
        instances
            .get(instance_id.as_str())
            .map(|handle| handle.record.socket_path.clone())
            .ok_or_else(|| AgoError::NoSuchAgent(instance_id.to_string()))
    }

    /// Graceful stop: `Shutdown` frame, wait, SIGTERM, wait, SIGKILL.
    /// Always reaps the socket file and the registry record.
    pub async fn stop(&self, instance_id: &InstanceId) -> AgoResult<()> {
        let mut handle = self
            .instances
            .write()
            .await
            .remove(instance_id.as_str())
            .ok_or_else(|| AgoError::NotRunning(instance_id.to_string()))?;

        info!(instance = %instance_id, pid = handle.record.pid, "stopping instance");
        let _ = self.registry.set_state(instance_id, InstanceState::Stopping);

        let _ = send_shutdown_frame(&handle.record.socket_path).await;

        if !wait_exit(&mut handle, self.grace_timeout).await {
            warn!(instance = %instance_id, "graceful shutdown timed out, sending SIGTERM");
            unsafe {
                libc::kill(handle.record.pid as libc::pid_t, libc::SIGTERM);
            }
            if !wait_exit(&mut handle, self.kill_timeout).await {
                warn!(instance = %instance_id, "SIGTERM ignored, sending SIGKILL");
                match handle.child.as_mut() {
                    Some(child) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                    None => unsafe {
                        libc::kill(handle.record.pid as libc::pid_t, libc::SIGKILL);
                    },
                }
            }
        }

        self.reap(instance_id);
        info!(instance = %instance_id, "instance stopped");
        Ok(())
    }

    pub async fn stop_all(&self) -> Vec<InstanceId> {
        let ids = self.live_ids().await;
        let mut stopped = Vec::with_capacity(ids.len());
        for id in ids {
            match self.stop(&id).await {
                Ok(()) => stopped.push(id),
                Err(e) => error!(instance = %id, error = %e, "failed to stop instance"),
            }
        }
        stopped
    }

    fn reap(&self, instance_id: &InstanceId) {
        let _ = std::fs::remove_file(self.home.instance_socket(instance_id));
        if let Err(e) = self.registry.remove(instance_id) {
            warn!(instance = %instance_id, error = %e, "failed to drop registry record");
        }
    }

    /// One health pass: ping every instance; two consecutive misses (or a
    /// dead child) marks it `Crashed` and reaps it. Returns the crashed
    /// instance IDs so the router can drop their queues.
    pub async fn health_check_round(&self) -> Vec<InstanceId> {
        let targets: Vec<(InstanceId, PathBuf)> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .map(|h| (h.record.instance_id.clone(), h.record.socket_path.clone()))
                .collect()
        };

        let mut crashed = Vec::new();
        for (id, socket) in targets {
            let ping = ping_instance(&socket, PING_TIMEOUT).await;

            let mut instances = self.instances.write().await;
            let Some(handle) = instances.get_mut(id.as_str()) else {
                continue; // stopped while we were pinging
            };

            let child_exited = match handle.child.as_mut() {
                Some(child) => child.try_wait().ok().flatten().is_some(),
                None => !pid_alive(handle.record.pid),
            };

            match ping {
                Ok(state) if !child_exited => {
                    handle.health_misses = 0;
                    if handle.record.state != state
                        && matches!(state, InstanceState::Ready | InstanceState::Stopping)
                    {
                        handle.record.state = state;
                    }
                }
                _ => {
                    handle.health_misses += 1;
                    debug!(
                        instance = %id,
                        misses = handle.health_misses,
                        child_exited,
                        "health probe missed"
                    );
                    if child_exited || handle.health_misses >= HEALTH_MISS_LIMIT {
                        warn!(instance = %id, "instance declared crashed");
                        handle.record.state = InstanceState::Crashed;
                        if let Some(child) = handle.child.as_mut() {
                            let _ = child.start_kill();
                        }
                        let Some(mut handle) = instances.remove(id.as_str()) else {
                            continue;
                        };
                        drop(instances);
                        if let Some(mut child) = handle.child.take() {
                            let _ = child.wait().await;
                        }
                        self.reap(&id);
                        crashed.push(id);
                        continue;
                    }
                }
            }
        }
        crashed
    }

    /// At startup: purge registry rows for dead PIDs, delete their socket
    /// files, and re-adopt workers from a previous daemon generation that
    /// still answer `Ping`.
    pub async fn cleanup_orphans(&self) -> AgoResult<()> {
        for record in self.registry.purge_dead()? {
            debug!(instance = %record.instance_id, "removing stale socket for dead instance");
            let _ = std::fs::remove_file(&record.socket_path);
        }

        for record in self.registry.load()? {
            match ping_instance(&record.socket_path, PING_TIMEOUT).await {
                Ok(_) => {
                    info!(instance = %record.instance_id, pid = record.pid, "re-adopting live worker");
                    self.instances.write().await.insert(
                        record.instance_id.to_string(),
                        ChildHandle {
                            record,
                            template: None,
                            child: None,
                            health_misses: 0,
                        },
                    );
                }
                Err(_) => {
                    warn!(instance = %record.instance_id, "orphan not responding, removing");
                    unsafe {
                        libc::kill(record.pid as libc::pid_t, libc::SIGTERM);
                    }
                    let _ = std::fs::remove_file(&record.socket_path);
                    self.registry.remove(&record.instance_id)?;
                }
            }
        }
        Ok(())
    }
}

async fn send_shutdown_frame(socket: &Path) -> AgoResult<()> {
    let op = async {
        let mut stream = UnixStream::connect(socket).await?;
        write_frame(&mut stream, &WorkerRequest::Shutdown).await?;
        let _ = read_frame::<_, WorkerReply>(&mut stream).await?;
        Ok(())
    };
    tokio::time::timeout(Duration::from_secs(2), op)
        .await
        .unwrap_or_else(|_| {
            Err(AgoError::SocketIo(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "shutdown frame timed out",
            )))
        })
}

async fn wait_exit(handle: &mut ChildHandle, timeout: Duration) -> bool {
    match handle.child.as_mut() {
        Some(child) => tokio::time::timeout(timeout, child.wait()).await.is_ok(),
        None => {
            let started = tokio::time::Instant::now();
            while started.elapsed() < timeout {
                if !pid_alive(handle.record.pid) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            !pid_alive(handle.record.pid)
        }
    }
}
