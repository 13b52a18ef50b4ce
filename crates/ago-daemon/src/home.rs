use ago_core::{AgoError, AgoResult, InstanceId};
use ago_registry::LayerPaths;
use std::path::{Path, PathBuf};

/// The per-user base directory (`$AGO_HOME`, default `$HOME/.ago`) and
/// everything the daemon keeps under it.
#[derive(Debug, Clone)]
pub struct AgoHome {
    base: PathBuf,
}

impl AgoHome {
    /// Resolve from `AGO_HOME` or the home directory and create the
    /// directory skeleton.
    pub fn resolve() -> AgoResult<Self> {
        let base = match std::env::var_os("AGO_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = std::env::var_os("HOME").ok_or_else(|| {
                    AgoError::BaseDirInaccessible("neither AGO_HOME nor HOME is set".into())
                })?;
                PathBuf::from(home).join(".ago")
            }
        };
        Self::at(base)
    }

    pub fn at(base: PathBuf) -> AgoResult<Self> {
        let home = Self { base };
        for dir in [
            home.base.clone(),
            home.processes_dir(),
            home.logs_dir(),
            home.builtin_templates_dir(),
            home.pulled_templates_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                AgoError::BaseDirInaccessible(format!("{}: {e}", dir.display()))
            })?;
        }
        Ok(home)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join("config.yaml")
    }

    /// `<cwd>/.ago/config.yaml` if the current working directory carries
    /// a project overlay.
    pub fn project_config_path() -> Option<PathBuf> {
        let candidate = std::env::current_dir().ok()?.join(".ago").join("config.yaml");
        candidate.is_file().then_some(candidate)
    }

    pub fn daemon_socket(&self) -> PathBuf {
        self.base.join("daemon.sock")
    }

    pub fn daemon_pid_file(&self) -> PathBuf {
        self.base.join("daemon.pid")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.logs_dir().join("daemon.log")
    }

    pub fn processes_dir(&self) -> PathBuf {
        self.base.join("processes")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.processes_dir().join("registry.json")
    }

    pub fn dead_letter_log(&self) -> PathBuf {
        self.logs_dir().join("dead_letter.log")
    }

    pub fn instance_socket(&self, id: &InstanceId) -> PathBuf {
        self.processes_dir().join(format!("{id}.sock"))
    }

    pub fn instance_log(&self, id: &InstanceId) -> PathBuf {
        self.logs_dir().join(format!("{id}.log"))
    }

    pub fn builtin_templates_dir(&self) -> PathBuf {
        self.base.join("registry").join("templates").join("builtin")
    }

    pub fn pulled_templates_dir(&self) -> PathBuf {
        self.base.join("registry").join("templates").join("pulled")
    }

    /// Template layers: project-local files come from the current
    /// working directory only.
    pub fn layer_paths(&self) -> LayerPaths {
        LayerPaths {
            local: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            pulled: self.pulled_templates_dir(),
            builtin: self.builtin_templates_dir(),
        }
    }
}
