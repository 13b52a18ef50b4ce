//! The crash-robust on-disk instance registry.
//!
//! The live daemon state is the source of truth; this file only exists so
//! a control client can answer `ps` after a daemon crash and so startup
//! can purge leftovers. Every access takes an exclusive advisory lock on
//! the file, so concurrent daemon and client reads never tear.

use ago_core::{AgoError, AgoResult, InstanceId, InstanceRecord, InstanceState};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use tracing::{info, warn};

pub struct RegistryFile {
    path: PathBuf,
}

/// True when a process with this PID exists (signal 0 probe).
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

impl RegistryFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn with_lock<T>(
        &self,
        mutate: impl FnOnce(&mut HashMap<String, InstanceRecord>) -> T,
    ) -> AgoResult<T> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(AgoError::SocketIo(std::io::Error::last_os_error()));
        }

        let mut raw = String::new();
        file.read_to_string(&mut raw)?;
        let mut records: HashMap<String, InstanceRecord> = if raw.trim().is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&raw)
                .map_err(|e| AgoError::RegistryCorrupt(format!("{}: {e}", self.path.display())))?
        };

        let result = mutate(&mut records);

        let serialized = serde_json::to_string_pretty(&records)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serialized.as_bytes())?;
        // Lock releases when `file` drops.
        Ok(result)
    }

    pub fn upsert(&self, record: InstanceRecord) -> AgoResult<()> {
        self.with_lock(|records| {
            records.insert(record.instance_id.to_string(), record);
        })
    }

    pub fn set_state(&self, id: &InstanceId, state: InstanceState) -> AgoResult<()> {
        self.with_lock(|records| {
            if let Some(record) = records.get_mut(id.as_str()) {
                record.state = state;
            }
        })
    }

    pub fn remove(&self, id: &InstanceId) -> AgoResult<()> {
        self.with_lock(|records| {
            records.remove(id.as_str());
        })
    }

    pub fn load(&self) -> AgoResult<Vec<InstanceRecord>> {
        self.with_lock(|records| records.values().cloned().collect())
    }

    /// Drop records whose PID is no longer alive and return them so the
    /// caller can delete stale socket files. A corrupt file is replaced
    /// with an empty one rather than wedging startup.
    pub fn purge_dead(&self) -> AgoResult<Vec<InstanceRecord>> {
        let purged = self.with_lock(|records| {
            let dead: Vec<String> = records
                .iter()
                .filter(|(_, record)| !pid_alive(record.pid))
                .map(|(key, _)| key.clone())
                .collect();
            dead.iter()
                .filter_map(|key| records.remove(key))
                .collect::<Vec<_>>()
        });

        match purged {
            Ok(purged) => {
                if !purged.is_empty() {
                    info!(count = purged.len(), "purged dead instance records");
                }
                Ok(purged)
            }
            Err(AgoError::RegistryCorrupt(msg)) => {
                warn!(error = %msg, "instance registry corrupt, resetting");
                std::fs::write(&self.path, "{}")?;
                Ok(Vec::new())
            }
            Err(other) => Err(other),
        }
    }
}
