//! Reasoner adapter: prompt assembly, the single LLM call, and parsing of
//! the structured decision. The adapter never loops; retries on parse
//! failure belong to the worker.

use crate::tools::ToolDescriptor;
use ago_core::{AgoError, AgoResult, ConversationEntry};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything one reasoning step needs to see.
pub struct PromptContext<'a> {
    pub instance_id: &'a str,
    pub template_prompt: &'a str,
    pub tools: &'a [ToolDescriptor],
    pub agent_network: &'a [String],
    pub history: &'a [ConversationEntry],
    pub scratchpad: &'a str,
    pub message: &'a str,
    /// Set when the current turn was started by a peer agent.
    pub sender: Option<&'a str>,
}

/// The parsed decision for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum ReasonerResult {
    FinalAnswer(String),
    ToolCall {
        name: String,
        params: serde_json::Value,
    },
    /// Continue reasoning with only a scratchpad note.
    Think(String),
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn reason(&self, ctx: &PromptContext<'_>) -> AgoResult<ReasonerResult>;
}

/// Narrow seam to the model provider: one prompt in, raw text out.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> AgoResult<String>;
}

// --- Prompt assembly ---

const AVAILABLE_TOOLS_PLACEHOLDER: &str = "{{AVAILABLE_TOOLS}}";
const AGENT_NETWORK_PLACEHOLDER: &str = "{{AGENT_NETWORK}}";

fn format_tools(tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return "(no tools available)".to_string();
    }
    tools
        .iter()
        .map(|t| format!("- {}: {}\n  parameters: {}", t.name, t.description, t.parameters_schema))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_network(network: &[String]) -> String {
    if network.is_empty() {
        return "(no other agents are running)".to_string();
    }
    network
        .iter()
        .map(|id| format!("- {id}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_history(history: &[ConversationEntry]) -> String {
    if history.is_empty() {
        return "No previous conversation.".to_string();
    }
    history
        .iter()
        .map(|e| format!("{}: {}", e.role, e.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Three segments: a fixed prefix (who the agent is, universal rules),
/// the template's custom section with placeholders substituted, and a
/// suffix that pins the expected YAML output grammar.
pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let tool_list = format_tools(ctx.tools);
    let network_list = format_network(ctx.agent_network);

    let custom = ctx
        .template_prompt
        .replace(AVAILABLE_TOOLS_PLACEHOLDER, &tool_list)
        .replace(AGENT_NETWORK_PLACEHOLDER, &network_list);

    let request = match ctx.sender {
        Some(sender) => format!("Message from {sender}: {}", ctx.message),
        None => ctx.message.to_string(),
    };

    format!(
        "You are agent instance {id}. You work inside a multi-agent system; always \
identify yourself by your instance ID, never by your template name. You follow \
the ReAct pattern: Thought, Action, Observation, repeated as needed, then a \
Final Answer.

{custom}

CONVERSATION HISTORY:
{history}

CURRENT REQUEST: {request}

AVAILABLE TOOLS:
{tools}

SCRATCHPAD (your reasoning so far):
{scratchpad}

REQUIRED OUTPUT FORMAT:
Respond with exactly one YAML block:

```yaml
thought: |
  Your reasoning about what to do next
observation: |
  What you observed from previous actions (empty on the first step)
action: think OR use_tool OR final
action_input:        # only when action is use_tool
  tool_name: name_here
  parameters:
    param: value
final_answer: |      # only when action is final
  Your complete response
```

Use exact field names, one action per response, and the | literal block \
style for multi-line fields.",
        id = ctx.instance_id,
        custom = custom,
        history = format_history(ctx.history),
        request = request,
        tools = tool_list,
        scratchpad = if ctx.scratchpad.is_empty() {
            "No previous reasoning."
        } else {
            ctx.scratchpad
        },
    )
}

// --- Decision parsing ---

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    thought: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    action_input: Option<RawActionInput>,
    #[serde(default)]
    final_answer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawActionInput {
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    parameters: Option<serde_yaml_ng::Value>,
}

fn extract_yaml_block(response: &str) -> Option<&str> {
    let start = response.find("```yaml")? + "```yaml".len();
    let rest = &response[start..];
    // Last fence, so multi-line literal blocks containing ``` survive.
    match rest.rfind("```") {
        Some(end) => Some(rest[..end].trim()),
        None => Some(rest.trim()),
    }
}

/// Parse the raw model output into a decision. A reply with no YAML block
/// is taken as a plain final answer; a malformed block is a structured
/// parse error the worker retries.
pub fn parse_decision(response: &str) -> AgoResult<ReasonerResult> {
    let Some(block) = extract_yaml_block(response) else {
        debug!("no YAML block in reasoner output, treating as final answer");
        return Ok(ReasonerResult::FinalAnswer(response.trim().to_string()));
    };

    let raw: RawDecision = serde_yaml_ng::from_str(block)
        .map_err(|e| AgoError::ReasonerParse(e.to_string()))?;

    match raw.action.as_deref() {
        Some("final") => {
            let text = raw
                .final_answer
                .ok_or_else(|| AgoError::ReasonerParse("action 'final' without final_answer".into()))?;
            Ok(ReasonerResult::FinalAnswer(text.trim().to_string()))
        }
        Some("use_tool") => {
            let input = raw
                .action_input
                .ok_or_else(|| AgoError::ReasonerParse("action 'use_tool' without action_input".into()))?;
            let name = input
                .tool_name
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| AgoError::ReasonerParse("use_tool without tool_name".into()))?;
            let params = match input.parameters {
                Some(value) => serde_json::to_value(&value)
                    .map_err(|e| AgoError::ReasonerParse(format!("unserialisable parameters: {e}")))?,
                None => serde_json::json!({}),
            };
            Ok(ReasonerResult::ToolCall { name, params })
        }
        Some("think") | None => Ok(ReasonerResult::Think(
            raw.thought.unwrap_or_else(|| "continuing".to_string()),
        )),
        Some(other) => {
            // Unknown actions keep the loop alive rather than failing the turn.
            warn!(action = %other, "unknown reasoner action, treating as think");
            Ok(ReasonerResult::Think(raw.thought.unwrap_or_default()))
        }
    }
}

/// The production reasoner: assemble, call the model once, parse.
pub struct YamlReasoner {
    model: Box<dyn ChatModel>,
}

impl YamlReasoner {
    pub fn new(model: Box<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Reasoner for YamlReasoner {
    async fn reason(&self, ctx: &PromptContext<'_>) -> AgoResult<ReasonerResult> {
        let prompt = build_prompt(ctx);
        let response = self.model.complete(&prompt).await?;
        parse_decision(&response)
    }
}

// --- Claude HTTP backend ---

/// Anthropic Messages API client. Retries rate-limit responses with a
/// short linear backoff, everything else surfaces to the caller.
pub struct ClaudeModel {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model_id: String,
    temperature: f32,
    max_tokens: u32,
}

impl ClaudeModel {
    pub fn new(api_key: String, model_id: String, temperature: f32) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: "https://api.anthropic.com".to_string(),
            api_key,
            model_id,
            temperature,
            max_tokens: 4096,
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }
}

#[async_trait]
impl ChatModel for ClaudeModel {
    async fn complete(&self, prompt: &str) -> AgoResult<String> {
        let url = format!("{}/v1/messages", self.api_base);
        let body = serde_json::json!({
            "model": self.model_id,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{"role": "user", "content": prompt}],
        });

        let max_retries = 3;
        for attempt in 0..max_retries {
            let resp = self
                .http
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .timeout(Duration::from_secs(60))
                .json(&body)
                .send()
                .await
                .map_err(|e| AgoError::Http(e.to_string()))?;

            let status = resp.status();
            if status.as_u16() == 429 || status.as_u16() == 529 {
                let wait = Duration::from_secs(3 + attempt as u64 * 2);
                warn!(status = %status, wait_secs = wait.as_secs(), "model API rate limited, backing off");
                tokio::time::sleep(wait).await;
                continue;
            }

            let resp_body: serde_json::Value =
                resp.json().await.map_err(|e| AgoError::Http(e.to_string()))?;
            if !status.is_success() {
                return Err(AgoError::Http(format!(
                    "model API error {status}: {resp_body}"
                )));
            }

            let text = resp_body["content"][0]["text"]
                .as_str()
                .ok_or_else(|| AgoError::Http("model response had no text content".into()))?;
            return Ok(text.to_string());
        }

        Err(AgoError::Http(format!(
            "model API still rate limited after {max_retries} attempts"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ago_core::Role;

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: format!("{name} tool"),
            parameters_schema: serde_json::json!({"type": "object"}),
        }
    }

    fn ctx<'a>(
        template_prompt: &'a str,
        tools: &'a [ToolDescriptor],
        network: &'a [String],
    ) -> PromptContext<'a> {
        PromptContext {
            instance_id: "researcher-a1b2c3d4",
            template_prompt,
            tools,
            agent_network: network,
            history: &[],
            scratchpad: "",
            message: "Summarise reinforcement learning",
            sender: None,
        }
    }

    #[test]
    fn test_prompt_substitutes_placeholders() {
        let tools = vec![descriptor("web_search")];
        let network = vec!["helper-e5f6a7b8".to_string()];
        let prompt = build_prompt(&ctx(
            "Tools you may use:\n{{AVAILABLE_TOOLS}}\nPeers:\n{{AGENT_NETWORK}}",
            &tools,
            &network,
        ));
        assert!(prompt.contains("web_search: web_search tool"));
        assert!(prompt.contains("- helper-e5f6a7b8"));
        assert!(!prompt.contains("{{AVAILABLE_TOOLS}}"));
        assert!(!prompt.contains("{{AGENT_NETWORK}}"));
    }

    #[test]
    fn test_prompt_identity_is_instance_id() {
        let prompt = build_prompt(&ctx("Be helpful.", &[], &[]));
        assert!(prompt.contains("You are agent instance researcher-a1b2c3d4"));
    }

    #[test]
    fn test_prompt_marks_peer_sender() {
        let tools = [];
        let network = [];
        let mut context = ctx("Be helpful.", &tools, &network);
        context.sender = Some("writer-00aa11bb");
        context.message = "please organise";
        let prompt = build_prompt(&context);
        assert!(prompt.contains("Message from writer-00aa11bb: please organise"));
    }

    #[test]
    fn test_parse_final_answer() {
        let response = "Sure.\n```yaml\nthought: |\n  Done reasoning\naction: final\nfinal_answer: |\n  RL trains agents by reward.\n```";
        match parse_decision(response).unwrap() {
            ReasonerResult::FinalAnswer(text) => {
                assert_eq!(text, "RL trains agents by reward.")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_tool_call() {
        let response = "```yaml\nthought: need data\naction: use_tool\naction_input:\n  tool_name: web_search\n  parameters:\n    query: reinforcement learning\n```";
        match parse_decision(response).unwrap() {
            ReasonerResult::ToolCall { name, params } => {
                assert_eq!(name, "web_search");
                assert_eq!(params["query"], "reinforcement learning");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_think() {
        let response = "```yaml\nthought: still working through it\naction: think\n```";
        match parse_decision(response).unwrap() {
            ReasonerResult::Think(thought) => assert!(thought.contains("working")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_no_block_is_final_answer() {
        match parse_decision("Just a plain reply.").unwrap() {
            ReasonerResult::FinalAnswer(text) => assert_eq!(text, "Just a plain reply."),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_block_is_parse_error() {
        let err = parse_decision("```yaml\n[not: valid: yaml\n```").unwrap_err();
        assert_eq!(err.kind(), "ReasonerParseError");
    }

    #[test]
    fn test_use_tool_without_name_is_parse_error() {
        let response = "```yaml\naction: use_tool\naction_input:\n  parameters: {}\n```";
        let err = parse_decision(response).unwrap_err();
        assert_eq!(err.kind(), "ReasonerParseError");
    }

    #[test]
    fn test_final_without_answer_is_parse_error() {
        let err = parse_decision("```yaml\naction: final\n```").unwrap_err();
        assert_eq!(err.kind(), "ReasonerParseError");
    }

    #[test]
    fn test_history_renders_roles() {
        let history = vec![
            ConversationEntry::new(Role::User, "hello"),
            ConversationEntry::new(Role::Assistant, "hi there"),
        ];
        let tools = [];
        let network = [];
        let mut context = ctx("Be helpful.", &tools, &network);
        context.history = &history;
        let prompt = build_prompt(&context);
        assert!(prompt.contains("user: hello"));
        assert!(prompt.contains("assistant: hi there"));
    }
}
