//! Per-instance agent worker: a single process owning one conversation
//! log and scratchpad, driving the prepare / decide / observe loop and
//! serving the instance socket.

pub mod bootstrap;
pub mod conversation;
pub mod reasoner;
pub mod runtime;
pub mod scratchpad;
pub mod tools;

pub use bootstrap::{ToolServerConfig, WorkerBootstrap};
pub use conversation::ConversationLog;
pub use reasoner::{
    build_prompt, parse_decision, ChatModel, ClaudeModel, PromptContext, Reasoner, ReasonerResult,
    YamlReasoner,
};
pub use runtime::AgentWorker;
pub use scratchpad::Scratchpad;
pub use tools::{McpToolInvoker, ToolDescriptor, ToolInvoker};
