use ago_core::{AgoError, AgoResult};
use serde::{Deserialize, Serialize};
use serde_yaml_ng::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::watch;
use tracing::{debug, warn};

const DEFAULT_CONFIG: &str = r#"
defaults:
  model: claude-3-5-haiku-20241022
  template_resolution_order: [local, pulled, builtin]
registries:
  ago_builtin:
    kind: builtin
    enabled: true
    priority: 1
daemon:
  queue_capacity: 1024
  health_interval_secs: 2
  grace_timeout_secs: 5
  kill_timeout_secs: 3
worker:
  max_turn_iterations: 25
  history_window: 20
  max_scratch_chars: 8000
  max_conversation_entries: 200
  tool_timeout_secs: 30
tools:
  servers: []
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    Global,
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Builtin,
    Http,
    Github,
    Gitlab,
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryKind::Builtin => write!(f, "builtin"),
            RegistryKind::Http => write!(f, "http"),
            RegistryKind::Github => write!(f, "github"),
            RegistryKind::Gitlab => write!(f, "gitlab"),
        }
    }
}

/// One named template registry from the `registries` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    #[serde(default)]
    pub url: String,
    pub kind: RegistryKind,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_priority() -> u32 {
    100
}
fn default_true() -> bool {
    true
}

/// Per-worker tuning knobs handed to each spawned worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLimits {
    pub max_turn_iterations: u32,
    pub history_window: usize,
    pub max_scratch_chars: usize,
    pub max_conversation_entries: usize,
    pub tool_timeout_secs: u64,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            max_turn_iterations: 25,
            history_window: 20,
            max_scratch_chars: 8000,
            max_conversation_entries: 200,
            tool_timeout_secs: 30,
        }
    }
}

/// Merged view over the global and project config files.
///
/// Reads go through accessors on the cached merge; writes go through
/// [`ConfigStore::set`], which rewrites the appropriate file on disk,
/// re-merges, and notifies subscribers so long-lived daemon state can
/// reload.
#[derive(Debug)]
pub struct ConfigStore {
    global_path: PathBuf,
    project_path: Option<PathBuf>,
    merged: RwLock<Value>,
    reload_tx: watch::Sender<u64>,
}

impl ConfigStore {
    pub fn load(global_path: PathBuf, project_path: Option<PathBuf>) -> AgoResult<Self> {
        let merged = Self::merge_all(&global_path, project_path.as_deref())?;
        let (reload_tx, _) = watch::channel(0);
        Ok(Self {
            global_path,
            project_path,
            merged: RwLock::new(merged),
            reload_tx,
        })
    }

    /// Receiver that ticks whenever a `set` rewrites config on disk.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.reload_tx.subscribe()
    }

    fn merge_all(global_path: &Path, project_path: Option<&Path>) -> AgoResult<Value> {
        let mut merged: Value = serde_yaml_ng::from_str(DEFAULT_CONFIG)?;

        if let Some(global) = load_yaml_file(global_path)? {
            merge(&mut merged, global);
        }
        if let Some(path) = project_path {
            if let Some(project) = load_yaml_file(path)? {
                debug!(path = %path.display(), "applying project config overlay");
                merge(&mut merged, project);
            }
        }
        substitute_env(&mut merged);
        Ok(merged)
    }

    fn reload(&self) -> AgoResult<()> {
        let merged = Self::merge_all(&self.global_path, self.project_path.as_deref())?;
        *self.merged.write().expect("config lock poisoned") = merged;
        self.reload_tx.send_modify(|gen| *gen += 1);
        Ok(())
    }

    /// Look up a value by dotted path in the merged view.
    pub fn get(&self, path: &str) -> Option<Value> {
        let merged = self.merged.read().expect("config lock poisoned");
        let mut cur: &Value = &merged;
        for key in path.split('.') {
            cur = cur.get(key)?;
        }
        Some(cur.clone())
    }

    /// Render a dotted-path value as a single-line string for `config get`.
    pub fn get_rendered(&self, path: &str) -> Option<String> {
        self.get(path).map(render_scalar)
    }

    /// The whole merged view as YAML, for `config show`.
    pub fn render_all(&self) -> AgoResult<String> {
        let merged = self.merged.read().expect("config lock poisoned");
        Ok(serde_yaml_ng::to_string(&*merged)?)
    }

    /// Set a dotted-path value in the global or project file, rewrite it,
    /// and notify subscribers. The value string is parsed as YAML so
    /// `true`, `42` and `[a, b]` keep their types.
    pub fn set(&self, scope: ConfigScope, path: &str, value: &str) -> AgoResult<()> {
        let parsed: Value = serde_yaml_ng::from_str(value)?;
        self.set_value(scope, path, parsed)
    }

    /// Like [`ConfigStore::set`] but with an already-typed value.
    pub fn set_value(&self, scope: ConfigScope, path: &str, value: Value) -> AgoResult<()> {
        if path.is_empty() {
            return Err(AgoError::ConfigInvalid("empty config key".into()));
        }
        let file = self.scope_path(scope);
        let mut root = load_yaml_file(&file)?.unwrap_or(Value::Mapping(Mapping::new()));
        set_path(&mut root, path, value);
        write_yaml_file(&file, &root)?;
        self.reload()
    }

    /// Remove a dotted-path key from the given scope's file.
    pub fn unset(&self, scope: ConfigScope, path: &str) -> AgoResult<()> {
        let file = self.scope_path(scope);
        let mut root = match load_yaml_file(&file)? {
            Some(root) => root,
            None => return Ok(()),
        };
        remove_path(&mut root, path);
        write_yaml_file(&file, &root)?;
        self.reload()
    }

    fn scope_path(&self, scope: ConfigScope) -> PathBuf {
        match scope {
            ConfigScope::Global => self.global_path.clone(),
            ConfigScope::Project => self
                .project_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(".ago").join("config.yaml")),
        }
    }

    // --- Typed accessors ---

    pub fn default_model(&self) -> String {
        self.get("defaults.model")
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "claude-3-5-haiku-20241022".to_string())
    }

    /// Layer names in resolution order, e.g. `["local", "pulled", "builtin"]`.
    pub fn template_resolution_order(&self) -> Vec<String> {
        self.get("defaults.template_resolution_order")
            .and_then(|v| {
                v.as_sequence().map(|seq| {
                    seq.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect::<Vec<_>>()
                })
            })
            .filter(|order| !order.is_empty())
            .unwrap_or_else(|| vec!["local".into(), "pulled".into(), "builtin".into()])
    }

    pub fn queue_capacity(&self) -> usize {
        self.get_u64("daemon.queue_capacity").unwrap_or(1024) as usize
    }

    pub fn health_interval_secs(&self) -> u64 {
        self.get_u64("daemon.health_interval_secs").unwrap_or(2)
    }

    pub fn grace_timeout_secs(&self) -> u64 {
        self.get_u64("daemon.grace_timeout_secs").unwrap_or(5)
    }

    pub fn kill_timeout_secs(&self) -> u64 {
        self.get_u64("daemon.kill_timeout_secs").unwrap_or(3)
    }

    pub fn worker_limits(&self) -> WorkerLimits {
        let defaults = WorkerLimits::default();
        WorkerLimits {
            max_turn_iterations: self
                .get_u64("worker.max_turn_iterations")
                .unwrap_or(defaults.max_turn_iterations as u64) as u32,
            history_window: self
                .get_u64("worker.history_window")
                .unwrap_or(defaults.history_window as u64) as usize,
            max_scratch_chars: self
                .get_u64("worker.max_scratch_chars")
                .unwrap_or(defaults.max_scratch_chars as u64) as usize,
            max_conversation_entries: self
                .get_u64("worker.max_conversation_entries")
                .unwrap_or(defaults.max_conversation_entries as u64)
                as usize,
            tool_timeout_secs: self
                .get_u64("worker.tool_timeout_secs")
                .unwrap_or(defaults.tool_timeout_secs),
        }
    }

    /// Enabled registries sorted by priority (lower number wins).
    pub fn registries(&self) -> Vec<RegistryEntry> {
        let section = match self.get("registries") {
            Some(Value::Mapping(map)) => map,
            _ => return Vec::new(),
        };

        let mut entries = Vec::new();
        for (key, value) in section {
            let name = match key.as_str() {
                Some(name) => name.to_string(),
                None => continue,
            };
            let mut value = value;
            if let Value::Mapping(map) = &mut value {
                map.insert(Value::String("name".into()), Value::String(name.clone()));
            }
            match serde_yaml_ng::from_value::<RegistryEntry>(value) {
                Ok(entry) if entry.enabled => entries.push(entry),
                Ok(_) => {}
                Err(e) => warn!(registry = %name, error = %e, "skipping malformed registry entry"),
            }
        }
        entries.sort_by_key(|r| r.priority);
        entries
    }

    /// The raw `tools.servers` section for worker bootstrap.
    pub fn tool_servers(&self) -> Value {
        self.get("tools.servers")
            .unwrap_or(Value::Sequence(Vec::new()))
    }

    fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(|v| v.as_u64())
    }
}

fn load_yaml_file(path: &Path) -> AgoResult<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_yaml_ng::from_str(&raw)
        .map_err(|e| AgoError::ConfigInvalid(format!("{}: {e}", path.display())))?;
    Ok(Some(value))
}

fn write_yaml_file(path: &Path, root: &Value) -> AgoResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_yaml_ng::to_string(root)?)?;
    Ok(())
}

/// Project overrides global: scalars overwrite, mappings deep-merge,
/// sequences fully replace.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) if slot.is_mapping() && value.is_mapping() => merge(slot, value),
                    Some(slot) => *slot = value,
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Expand `${NAME}` on every string leaf. Unknown names become empty.
fn substitute_env(value: &mut Value) {
    match value {
        Value::String(s) => *s = expand_env(s),
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env(v);
            }
        }
        Value::Sequence(seq) => {
            for v in seq {
                substitute_env(v);
            }
        }
        _ => {}
    }
}

fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn set_path(root: &mut Value, path: &str, value: Value) {
    let keys: Vec<&str> = path.split('.').collect();
    let mut cur = root;
    for (i, key) in keys.iter().enumerate() {
        if !cur.is_mapping() {
            *cur = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(map) = cur else {
            return;
        };
        let key = Value::String((*key).to_string());
        if i == keys.len() - 1 {
            map.insert(key, value);
            return;
        }
        cur = map
            .entry(key)
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
}

fn remove_path(root: &mut Value, path: &str) {
    let keys: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = keys.split_last() else {
        return;
    };
    let mut cur = root;
    for key in parents {
        match cur.get_mut(*key) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Value::Mapping(map) = cur {
        map.remove(Value::String((*last).to_string()));
    }
}

fn render_scalar(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => serde_yaml_ng::to_string(&other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn store_with(global: &str, project: Option<&str>) -> (ConfigStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let global_path = tmp.path().join("config.yaml");
        fs::write(&global_path, global).unwrap();
        let project_path = project.map(|body| {
            let path = tmp.path().join(".ago").join("config.yaml");
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, body).unwrap();
            path
        });
        let store = ConfigStore::load(global_path, project_path).unwrap();
        (store, tmp)
    }

    #[test]
    fn test_defaults_apply_without_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(tmp.path().join("config.yaml"), None).unwrap();
        assert_eq!(
            store.template_resolution_order(),
            vec!["local", "pulled", "builtin"]
        );
        assert_eq!(store.queue_capacity(), 1024);
        assert_eq!(store.health_interval_secs(), 2);
    }

    #[test]
    fn test_project_scalar_overrides_global() {
        let (store, _tmp) = store_with(
            "defaults:\n  model: global-model\n",
            Some("defaults:\n  model: project-model\n"),
        );
        assert_eq!(store.default_model(), "project-model");
    }

    #[test]
    fn test_mappings_deep_merge() {
        let (store, _tmp) = store_with(
            "daemon:\n  queue_capacity: 64\n  health_interval_secs: 7\n",
            Some("daemon:\n  queue_capacity: 8\n"),
        );
        // Overridden key takes the project value, sibling survives.
        assert_eq!(store.queue_capacity(), 8);
        assert_eq!(store.health_interval_secs(), 7);
    }

    #[test]
    fn test_lists_fully_replace() {
        let (store, _tmp) = store_with(
            "defaults:\n  template_resolution_order: [local, pulled, builtin]\n",
            Some("defaults:\n  template_resolution_order: [builtin]\n"),
        );
        assert_eq!(store.template_resolution_order(), vec!["builtin"]);
    }

    #[test]
    fn test_env_substitution_on_string_leaves() {
        std::env::set_var("AGO_TEST_TOKEN", "sekrit");
        let (store, _tmp) = store_with(
            "registries:\n  hub:\n    kind: http\n    url: https://example.com/t\n    token: ${AGO_TEST_TOKEN}\n",
            None,
        );
        let regs = store.registries();
        let hub = regs.iter().find(|r| r.name == "hub").unwrap();
        assert_eq!(hub.token.as_deref(), Some("sekrit"));
        std::env::remove_var("AGO_TEST_TOKEN");
    }

    #[test]
    fn test_unknown_env_expands_empty() {
        assert_eq!(expand_env("x${AGO_DOES_NOT_EXIST_42}y"), "xy");
        assert_eq!(expand_env("no refs"), "no refs");
        assert_eq!(expand_env("dangling ${open"), "dangling ${open");
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let (store, _tmp) = store_with("", None);
        store
            .set(ConfigScope::Global, "defaults.model", "claude-sonnet-4")
            .unwrap();
        assert_eq!(
            store.get_rendered("defaults.model").as_deref(),
            Some("claude-sonnet-4")
        );
    }

    #[test]
    fn test_set_notifies_subscribers() {
        let (store, _tmp) = store_with("", None);
        let rx = store.subscribe();
        let before = *rx.borrow();
        store
            .set(ConfigScope::Global, "daemon.queue_capacity", "2048")
            .unwrap();
        assert_ne!(*rx.borrow(), before);
        assert_eq!(store.queue_capacity(), 2048);
    }

    #[test]
    fn test_set_preserves_value_types() {
        let (store, _tmp) = store_with("", None);
        store
            .set(ConfigScope::Global, "daemon.queue_capacity", "512")
            .unwrap();
        assert_eq!(store.get("daemon.queue_capacity"), Some(Value::from(512)));
    }

    #[test]
    fn test_registries_sorted_by_priority_and_filtered() {
        let (store, _tmp) = store_with(
            r#"
registries:
  slow:
    kind: http
    url: https://b.example/t
    priority: 50
  fast:
    kind: github
    url: https://github.com/a/t
    priority: 2
  off:
    kind: http
    url: https://c.example/t
    enabled: false
"#,
            None,
        );
        let regs = store.registries();
        let names: Vec<&str> = regs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["ago_builtin", "fast", "slow"]);
    }

    #[test]
    fn test_unset_removes_key() {
        let (store, _tmp) = store_with("", None);
        store
            .set(ConfigScope::Global, "registries.extra.kind", "http")
            .unwrap();
        assert!(store.get("registries.extra").is_some());
        store.unset(ConfigScope::Global, "registries.extra").unwrap();
        assert!(store.get("registries.extra").is_none());
    }

    #[test]
    fn test_invalid_yaml_is_config_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        fs::write(&path, "defaults: [unclosed").unwrap();
        let err = ConfigStore::load(path, None).unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }
}
