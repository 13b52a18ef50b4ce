//! Tool adapter: discovery and invocation of external tool servers over
//! JSON-RPC 2.0 on subprocess stdio. Discovery is passive: the declared
//! surface is cached at connect time, and each invocation carries a
//! deadline whose expiry is an observation for the reasoning loop, not a
//! fatal error.

use crate::bootstrap::ToolServerConfig;
use ago_core::{AgoError, AgoResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// A named external capability the reasoner may elect to invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    fn list(&self) -> Vec<ToolDescriptor>;

    /// Invoke `name` with a parameter map. Deadline expiry yields
    /// `ToolTimeout`.
    async fn invoke(
        &self,
        name: &str,
        params: serde_json::Value,
        deadline: Duration,
    ) -> AgoResult<String>;
}

// --- JSON-RPC 2.0 message types ---

#[derive(Debug, Clone, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<u64>,
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcToolDef {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    input_schema: serde_json::Value,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone, Deserialize)]
struct RpcToolResult {
    #[serde(default)]
    content: Vec<RpcContent>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcContent {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    #[serde(default)]
    text: String,
}

/// One tool-server subprocess speaking JSON-RPC over stdio.
struct ToolServer {
    stdin: Mutex<tokio::process::ChildStdin>,
    _child: Mutex<Child>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
    next_id: AtomicU64,
    name: String,
}

impl ToolServer {
    async fn connect(config: &ToolServerConfig) -> AgoResult<(Arc<Self>, Vec<RpcToolDef>)> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());
        for (key, val) in &config.env {
            cmd.env(key, val);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AgoError::SpawnFailed(format!("tool server '{}': {e}", config.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgoError::SpawnFailed("tool server stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgoError::SpawnFailed("tool server stdout unavailable".into()))?;

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let pending_reader = pending.clone();
        let server_name = config.command.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!(server = %server_name, "tool server stdout closed");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                            Ok(resp) => {
                                if let Some(id) = resp.id {
                                    if let Some(tx) = pending_reader.lock().await.remove(&id) {
                                        let _ = tx.send(resp);
                                    }
                                }
                            }
                            Err(e) => {
                                debug!(server = %server_name, error = %e, "non-JSON-RPC line from tool server");
                            }
                        }
                    }
                    Err(e) => {
                        error!(server = %server_name, error = %e, "error reading tool server stdout");
                        break;
                    }
                }
            }
        });

        let server = Arc::new(Self {
            stdin: Mutex::new(stdin),
            _child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            name: config.command.clone(),
        });

        server
            .request(
                "initialize",
                Some(serde_json::json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "ago", "version": env!("CARGO_PKG_VERSION")},
                })),
                Duration::from_secs(30),
            )
            .await?;
        server.notify("notifications/initialized").await?;

        let tools = server.list_tools().await?;
        info!(server = %server.name, tools = tools.len(), "tool server connected");
        Ok((server, tools))
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: Duration,
    ) -> AgoResult<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let payload = serde_json::to_string(&req)?;
        {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(payload.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
        }

        let resp = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(AgoError::DecodeFailure(format!(
                    "tool server '{}' dropped the response channel",
                    self.name
                )))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(AgoError::ToolTimeout(method.to_string()));
            }
        };

        if let Some(err) = &resp.error {
            return Err(AgoError::Http(format!(
                "tool server '{}' error {}: {}",
                self.name, err.code, err.message
            )));
        }
        Ok(resp)
    }

    async fn notify(&self, method: &str) -> AgoResult<()> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": {},
        })
        .to_string();
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn list_tools(&self) -> AgoResult<Vec<RpcToolDef>> {
        let resp = self
            .request("tools/list", None, Duration::from_secs(30))
            .await?;
        let result = resp
            .result
            .ok_or_else(|| AgoError::DecodeFailure("empty tools/list result".into()))?;
        let tools = serde_json::from_value(
            result
                .get("tools")
                .cloned()
                .unwrap_or(serde_json::json!([])),
        )?;
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        params: serde_json::Value,
        deadline: Duration,
    ) -> AgoResult<String> {
        let resp = self
            .request(
                "tools/call",
                Some(serde_json::json!({"name": name, "arguments": params})),
                deadline,
            )
            .await
            .map_err(|e| match e {
                AgoError::ToolTimeout(_) => AgoError::ToolTimeout(name.to_string()),
                other => other,
            })?;
        let result = resp
            .result
            .ok_or_else(|| AgoError::DecodeFailure("empty tools/call result".into()))?;
        let parsed: RpcToolResult = serde_json::from_value(result)?;

        let text = parsed
            .content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if parsed.is_error {
            return Err(AgoError::Http(format!("tool '{name}' failed: {text}")));
        }
        Ok(text)
    }
}

/// Aggregates every connected tool server behind one invocation surface,
/// filtered down to the tool names the template declared.
pub struct McpToolInvoker {
    descriptors: Vec<ToolDescriptor>,
    routes: HashMap<String, Arc<ToolServer>>,
}

impl McpToolInvoker {
    /// Connect the configured servers and cache their declared surface.
    /// A server that fails to start is skipped with a warning; the worker
    /// still runs with whatever surface remains.
    pub async fn connect(configs: &[ToolServerConfig], declared: &[String]) -> Self {
        let mut descriptors = Vec::new();
        let mut routes = HashMap::new();

        for config in configs {
            match ToolServer::connect(config).await {
                Ok((server, tools)) => {
                    for tool in tools {
                        if !tool_is_declared(&tool.name, declared) {
                            continue;
                        }
                        if routes.contains_key(&tool.name) {
                            warn!(tool = %tool.name, "duplicate tool name, keeping first server");
                            continue;
                        }
                        routes.insert(tool.name.clone(), server.clone());
                        descriptors.push(ToolDescriptor {
                            name: tool.name,
                            description: tool.description,
                            parameters_schema: tool.input_schema,
                        });
                    }
                }
                Err(e) => {
                    warn!(server = %config.command, error = %e, "skipping unreachable tool server");
                }
            }
        }

        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            descriptors,
            routes,
        }
    }
}

/// A template with no declared tools gets the whole surface; otherwise a
/// declared name matches any tool whose name contains it,
/// case-insensitively.
fn tool_is_declared(tool_name: &str, declared: &[String]) -> bool {
    if declared.is_empty() {
        return true;
    }
    let lowered = tool_name.to_lowercase();
    declared.iter().any(|d| lowered.contains(&d.to_lowercase()))
}

#[async_trait]
impl ToolInvoker for McpToolInvoker {
    fn list(&self) -> Vec<ToolDescriptor> {
        self.descriptors.clone()
    }

    async fn invoke(
        &self,
        name: &str,
        params: serde_json::Value,
        deadline: Duration,
    ) -> AgoResult<String> {
        let server = self
            .routes
            .get(name)
            .ok_or_else(|| AgoError::Http(format!("unknown tool '{name}'")))?;
        server.call_tool(name, params, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_is_declared_matching() {
        let declared = vec!["web_search".to_string(), "file".to_string()];
        assert!(tool_is_declared("web_search", &declared));
        assert!(tool_is_declared("mcp_file_manager", &declared));
        assert!(tool_is_declared("File_Read", &declared));
        assert!(!tool_is_declared("shell_exec", &declared));
        // Empty declaration keeps everything.
        assert!(tool_is_declared("anything", &[]));
    }

    #[test]
    fn test_rpc_tool_def_defaults() {
        let def: RpcToolDef = serde_json::from_str(r#"{"name":"read_file"}"#).unwrap();
        assert_eq!(def.name, "read_file");
        assert_eq!(def.description, "");
        assert_eq!(def.input_schema["type"], "object");
    }

    #[test]
    fn test_rpc_tool_result_parse() {
        let json = r#"{"content":[{"type":"text","text":"line one"},{"type":"text","text":"line two"}],"isError":false}"#;
        let result: RpcToolResult = serde_json::from_str(json).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_skipped() {
        let configs = vec![ToolServerConfig {
            command: "/nonexistent/tool-server".into(),
            args: vec![],
            env: HashMap::new(),
        }];
        let invoker = McpToolInvoker::connect(&configs, &[]).await;
        assert!(invoker.list().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_invoke_errors() {
        let invoker = McpToolInvoker::connect(&[], &[]).await;
        let err = invoker
            .invoke("ghost", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }
}
