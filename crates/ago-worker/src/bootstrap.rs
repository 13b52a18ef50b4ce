use ago_config::WorkerLimits;
use ago_core::InstanceId;
use ago_registry::Template;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// One tool-server subprocess the worker should connect to at startup.
/// How these are launched is the tool server's business; the worker only
/// speaks JSON-RPC over their stdio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// The startup handshake record the daemon hands a freshly spawned
/// worker, serialized as JSON in the single command-line argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    pub instance_id: InstanceId,
    pub template: Template,
    /// Resolved model id (template's, or the configured default).
    pub model: String,
    pub limits: WorkerLimits,
    pub tool_servers: Vec<ToolServerConfig>,
    /// Instance IDs of peers known at spawn time, for the
    /// `{{AGENT_NETWORK}}` prompt placeholder.
    pub agent_network: Vec<String>,
    pub socket_path: PathBuf,
    pub daemon_socket_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_survives_json_round_trip() {
        let boot = WorkerBootstrap {
            instance_id: InstanceId::mint("researcher"),
            template: Template::parse("name: researcher\nprompt: |\n  Research things.\n", "researcher")
                .unwrap(),
            model: "claude-3-5-haiku-20241022".into(),
            limits: WorkerLimits::default(),
            tool_servers: vec![ToolServerConfig {
                command: "mcp-files".into(),
                args: vec!["--root".into(), "/tmp".into()],
                env: HashMap::new(),
            }],
            agent_network: vec!["helper-e5f6a7b8".into()],
            socket_path: "/tmp/x.sock".into(),
            daemon_socket_path: "/tmp/daemon.sock".into(),
        };
        let json = serde_json::to_string(&boot).unwrap();
        let back: WorkerBootstrap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_id, boot.instance_id);
        assert_eq!(back.template.name, "researcher");
        assert_eq!(back.tool_servers.len(), 1);
    }
}
