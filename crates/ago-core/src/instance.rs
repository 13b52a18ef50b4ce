use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle state of one agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Ready,
    Stopping,
    Stopped,
    Crashed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Ready => write!(f, "ready"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Crashed => write!(f, "crashed"),
        }
    }
}

/// Opaque canonical identity of one live worker: `{template-name}-{8 hex}`.
///
/// The ID, never the template name, is what message routing, socket paths
/// and log filenames key on. The hex suffix is the head of a random v4
/// UUID; callers re-roll on the (vanishingly rare) collision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn mint(template_name: &str) -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("{template_name}-{}", &hex[..8]))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (template, suffix) = raw.rsplit_once('-')?;
        if template.is_empty() || suffix.len() != 8 {
            return None;
        }
        if !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    /// The template name the instance was materialised from.
    pub fn template_name(&self) -> &str {
        self.0.rsplit_once('-').map(|(t, _)| t).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of the crash-robust on-disk instance registry
/// (`processes/registry.json`). The live daemon state is authoritative;
/// this file only exists so `ps` and startup cleanup survive a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub template: String,
    pub model: String,
    pub pid: u32,
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    pub state: InstanceState,
    pub spawned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_mint_shape() {
        let id = InstanceId::mint("researcher");
        let s = id.as_str();
        assert!(s.starts_with("researcher-"));
        let suffix = s.rsplit_once('-').unwrap().1;
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_mint_is_unique_in_practice() {
        let ids: HashSet<String> = (0..64)
            .map(|_| InstanceId::mint("writer").as_str().to_string())
            .collect();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn test_template_name_round_trip() {
        let id = InstanceId::mint("data-analyst");
        assert_eq!(id.template_name(), "data-analyst");
    }

    #[test]
    fn test_parse_accepts_minted_ids() {
        let id = InstanceId::mint("helper");
        assert_eq!(InstanceId::parse(id.as_str()), Some(id));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(InstanceId::parse("no-suffix-here").is_none());
        assert!(InstanceId::parse("helper-zzzzzzzz").is_none());
        assert!(InstanceId::parse("helper").is_none());
        assert!(InstanceId::parse("-a1b2c3d4").is_none());
    }
}
