use ago_worker::{
    AgentWorker, ClaudeModel, McpToolInvoker, WorkerBootstrap, YamlReasoner,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The daemon wires this process's stdout/stderr to the per-instance
    // log file, so plain fmt output lands in the right place.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let handshake = std::env::args().nth(1).ok_or_else(|| {
        anyhow::anyhow!("usage: ago-worker <bootstrap-json> (spawned by the ago daemon)")
    })?;
    let boot: WorkerBootstrap = serde_json::from_str(&handshake)?;

    info!(
        instance = %boot.instance_id,
        template = %boot.template.name,
        model = %boot.model,
        "bootstrapping worker"
    );

    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        warn!("ANTHROPIC_API_KEY is not set; reasoner calls will fail until it is");
    }
    let model = ClaudeModel::new(api_key, boot.model.clone(), boot.template.temperature);
    let reasoner = Arc::new(YamlReasoner::new(Box::new(model)));

    let tools = Arc::new(McpToolInvoker::connect(&boot.tool_servers, &boot.template.tools).await);

    let worker = AgentWorker::new(boot, reasoner, tools);
    worker.run().await?;
    Ok(())
}
