//! The per-instance worker event loop.
//!
//! One worker process per instance. A socket task accepts control
//! connections (ping, chat, delivery, history, shutdown) and a single
//! turn task runs the reasoning loop, so turns are strictly sequential:
//! anything that arrives during a live turn parks in the inbound queue.

use crate::bootstrap::WorkerBootstrap;
use crate::conversation::ConversationLog;
use crate::reasoner::{PromptContext, Reasoner, ReasonerResult};
use crate::scratchpad::Scratchpad;
use crate::tools::ToolInvoker;
use ago_core::{
    read_frame, write_frame, AgoError, AgoResult, Event, EventKind, Frame, InstanceState, Request,
    Response, Role, Status, WorkerReply, WorkerRequest,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

const INBOUND_QUEUE_DEPTH: usize = 64;
const SEEN_MESSAGE_WINDOW: usize = 256;
const GRACEFUL_ANSWER: &str = "I could not form a valid step";

/// Intra-turn control state, separate from the daemon-visible lifecycle.
/// `Idle -> Preparing -> AwaitingReasoner -> (AwaitingTool ->)* -> Emitting -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerPhase {
    Idle,
    Preparing,
    AwaitingReasoner,
    AwaitingTool,
    Emitting,
}

enum TurnSource {
    /// A client chat; events stream back through this channel.
    Chat {
        events: mpsc::Sender<WorkerReply>,
    },
    /// A message delivered from a peer agent.
    Peer { from: String },
}

struct TurnInput {
    text: String,
    source: TurnSource,
}

struct Shared {
    state: RwLock<InstanceState>,
    phase: RwLock<WorkerPhase>,
    conversation: Mutex<ConversationLog>,
    /// Routed message IDs already accepted, so re-deliveries append the
    /// payload to the conversation log at most once.
    seen_ids: Mutex<VecDeque<u64>>,
}

impl Shared {
    async fn set_phase(&self, phase: WorkerPhase) {
        *self.phase.write().await = phase;
        debug!(?phase, "phase transition");
    }
}

pub struct AgentWorker {
    boot: WorkerBootstrap,
    reasoner: Arc<dyn Reasoner>,
    tools: Arc<dyn ToolInvoker>,
}

impl AgentWorker {
    pub fn new(
        boot: WorkerBootstrap,
        reasoner: Arc<dyn Reasoner>,
        tools: Arc<dyn ToolInvoker>,
    ) -> Self {
        Self {
            boot,
            reasoner,
            tools,
        }
    }

    pub async fn run(self) -> AgoResult<()> {
        let instance_id = self.boot.instance_id.clone();
        info!(instance = %instance_id, template = %self.boot.template.name, "worker starting");

        if self.boot.socket_path.exists() {
            let _ = std::fs::remove_file(&self.boot.socket_path);
        }
        let listener = UnixListener::bind(&self.boot.socket_path)
            .map_err(|e| AgoError::BindFailed(format!("{}: {e}", self.boot.socket_path.display())))?;

        let shared = Arc::new(Shared {
            state: RwLock::new(InstanceState::Starting),
            phase: RwLock::new(WorkerPhase::Idle),
            conversation: Mutex::new(ConversationLog::new(
                self.boot.limits.max_conversation_entries,
            )),
            seen_ids: Mutex::new(VecDeque::new()),
        });

        register_with_daemon(&self.boot).await?;
        *shared.state.write().await = InstanceState::Ready;
        info!(instance = %instance_id, "worker ready");

        let (turn_tx, turn_rx) = mpsc::channel::<TurnInput>(INBOUND_QUEUE_DEPTH);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let turn_task = tokio::spawn(turn_loop(
            shared.clone(),
            Arc::new(self.boot.clone()),
            self.reasoner.clone(),
            self.tools.clone(),
            turn_rx,
        ));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let shared = shared.clone();
                            let turn_tx = turn_tx.clone();
                            let shutdown_tx = shutdown_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, shared, turn_tx, shutdown_tx).await {
                                    debug!(error = %e, "worker connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed on worker socket");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }

        info!(instance = %instance_id, "worker shutting down");
        *shared.state.write().await = InstanceState::Stopping;
        drop(turn_tx);
        if tokio::time::timeout(Duration::from_secs(3), turn_task)
            .await
            .is_err()
        {
            warn!(instance = %instance_id, "turn still in flight at shutdown, abandoning it");
        }
        *shared.state.write().await = InstanceState::Stopped;
        let _ = std::fs::remove_file(&self.boot.socket_path);
        Ok(())
    }
}

/// Announce readiness on the daemon control socket.
async fn register_with_daemon(boot: &WorkerBootstrap) -> AgoResult<()> {
    let mut stream = UnixStream::connect(&boot.daemon_socket_path).await?;
    write_frame(
        &mut stream,
        &Frame::Request(Request::RegisterWorker {
            instance_id: boot.instance_id.clone(),
        }),
    )
    .await?;
    match read_frame::<_, Frame>(&mut stream).await? {
        Some(Frame::Response(Response {
            status: Status::Ok, ..
        })) => Ok(()),
        Some(Frame::Response(Response { payload, .. })) => Err(AgoError::SpawnFailed(format!(
            "daemon rejected registration: {payload:?}"
        ))),
        other => Err(AgoError::DecodeFailure(format!(
            "unexpected registration reply: {other:?}"
        ))),
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    shared: Arc<Shared>,
    turn_tx: mpsc::Sender<TurnInput>,
    shutdown_tx: watch::Sender<bool>,
) -> AgoResult<()> {
    let request = match read_frame::<_, WorkerRequest>(&mut stream).await? {
        Some(request) => request,
        None => return Ok(()),
    };

    match request {
        WorkerRequest::Ping => {
            let state = *shared.state.read().await;
            write_frame(&mut stream, &WorkerReply::Pong { state }).await?;
        }

        WorkerRequest::History { tail } => {
            let entries = shared.conversation.lock().await.tail(tail);
            write_frame(&mut stream, &WorkerReply::History { entries }).await?;
        }

        WorkerRequest::LogOutgoing { to, message } => {
            debug!(to = %to, "mirroring outgoing message into conversation log");
            shared
                .conversation
                .lock()
                .await
                .push(Role::Assistant, message);
            write_frame(&mut stream, &WorkerReply::Ack).await?;
        }

        WorkerRequest::Deliver { id, from, message } => {
            let fresh = {
                let mut seen = shared.seen_ids.lock().await;
                if seen.contains(&id) {
                    false
                } else {
                    seen.push_back(id);
                    while seen.len() > SEEN_MESSAGE_WINDOW {
                        seen.pop_front();
                    }
                    true
                }
            };
            if !fresh {
                debug!(message_id = id, "dropping re-delivered message");
                write_frame(&mut stream, &WorkerReply::Ack).await?;
                return Ok(());
            }
            let input = TurnInput {
                text: message,
                source: TurnSource::Peer { from },
            };
            match turn_tx.try_send(input) {
                Ok(()) => write_frame(&mut stream, &WorkerReply::Ack).await?,
                Err(_) => {
                    // Let the router retry later rather than blocking it.
                    shared.seen_ids.lock().await.retain(|seen| *seen != id);
                    write_frame(
                        &mut stream,
                        &WorkerReply::Err {
                            kind: "QueueFull".into(),
                            message: "worker inbound queue is full".into(),
                        },
                    )
                    .await?;
                }
            }
        }

        WorkerRequest::Chat { message } => {
            let (events_tx, mut events_rx) = mpsc::channel::<WorkerReply>(32);
            let input = TurnInput {
                text: message,
                source: TurnSource::Chat { events: events_tx },
            };
            if turn_tx.try_send(input).is_err() {
                write_frame(
                    &mut stream,
                    &WorkerReply::Err {
                        kind: "QueueFull".into(),
                        message: "worker inbound queue is full".into(),
                    },
                )
                .await?;
                return Ok(());
            }

            // Relay until the turn finishes. A client that goes away stops
            // the relay but never the turn: keep draining so the turn task
            // is not blocked on a dead channel.
            let mut client_gone = false;
            while let Some(reply) = events_rx.recv().await {
                let terminal = matches!(
                    reply,
                    WorkerReply::TurnDone { .. } | WorkerReply::Err { .. }
                );
                if !client_gone && write_frame(&mut stream, &reply).await.is_err() {
                    debug!("chat client disconnected mid-turn, finishing turn anyway");
                    client_gone = true;
                }
                if terminal {
                    break;
                }
            }
        }

        WorkerRequest::Shutdown => {
            info!("shutdown requested");
            write_frame(&mut stream, &WorkerReply::Ack).await?;
            let _ = shutdown_tx.send(true);
        }
    }

    Ok(())
}

async fn turn_loop(
    shared: Arc<Shared>,
    boot: Arc<WorkerBootstrap>,
    reasoner: Arc<dyn Reasoner>,
    tools: Arc<dyn ToolInvoker>,
    mut turn_rx: mpsc::Receiver<TurnInput>,
) {
    while let Some(input) = turn_rx.recv().await {
        run_turn(
            shared.as_ref(),
            boot.as_ref(),
            reasoner.as_ref(),
            tools.as_ref(),
            input,
        )
        .await;
        shared.set_phase(WorkerPhase::Idle).await;
    }
}

async fn emit(events: Option<&mpsc::Sender<WorkerReply>>, kind: EventKind, payload: String) {
    if let Some(tx) = events {
        let _ = tx.send(WorkerReply::Event(Event::new(kind, payload))).await;
    }
}

/// One complete prepare / decide / observe cycle, bounded by the
/// configured iteration cap and terminating in turn-complete or
/// turn-truncated.
async fn run_turn(
    shared: &Shared,
    boot: &WorkerBootstrap,
    reasoner: &dyn Reasoner,
    tools: &dyn ToolInvoker,
    input: TurnInput,
) {
    let limits = &boot.limits;
    let (sender, events) = match &input.source {
        TurnSource::Chat { events } => (None, Some(events)),
        TurnSource::Peer { from } => (Some(from.as_str()), None),
    };

    shared.set_phase(WorkerPhase::Preparing).await;
    {
        let mut conversation = shared.conversation.lock().await;
        match &input.source {
            TurnSource::Chat { .. } => conversation.push(Role::User, input.text.clone()),
            TurnSource::Peer { .. } => conversation.push(Role::Agent, input.text.clone()),
        }
    }

    let tool_surface = tools.list();
    let mut scratchpad = Scratchpad::new(limits.max_scratch_chars);
    let mut iterations = 0u32;
    let mut parse_failures = 0u32;

    loop {
        if iterations >= limits.max_turn_iterations {
            warn!(iterations, "turn iteration cap reached, truncating");
            shared.set_phase(WorkerPhase::Emitting).await;
            emit(events, EventKind::TurnTruncated, String::new()).await;
            finish_turn(events, String::new()).await;
            return;
        }

        let history = shared
            .conversation
            .lock()
            .await
            .window(limits.history_window);
        let ctx = PromptContext {
            instance_id: boot.instance_id.as_str(),
            template_prompt: &boot.template.prompt,
            tools: &tool_surface,
            agent_network: &boot.agent_network,
            history: &history,
            scratchpad: scratchpad.view(),
            message: &input.text,
            sender,
        };

        shared.set_phase(WorkerPhase::AwaitingReasoner).await;
        match reasoner.reason(&ctx).await {
            Err(AgoError::ReasonerParse(msg)) => {
                parse_failures += 1;
                warn!(attempt = parse_failures, error = %msg, "reasoner output unparseable");
                if parse_failures >= 3 {
                    shared.set_phase(WorkerPhase::Emitting).await;
                    let text = GRACEFUL_ANSWER.to_string();
                    shared
                        .conversation
                        .lock()
                        .await
                        .push(Role::Assistant, text.clone());
                    emit(events, EventKind::TurnComplete, text.clone()).await;
                    finish_turn(events, text).await;
                    return;
                }
                scratchpad.append(&format!(
                    "PARSE_ERROR: {msg}. Reply again with exactly one ```yaml block."
                ));
            }

            Err(other) => {
                // Transport and provider failures are observations the
                // loop can reason about, not turn failures.
                warn!(error = %other, "reasoner call failed");
                scratchpad.append(&format!("OBSERVATION: reasoner unavailable: {other}"));
                emit(events, EventKind::Error, other.to_string()).await;
                iterations += 1;
            }

            Ok(ReasonerResult::Think(thought)) => {
                debug!(iteration = iterations, "thinking");
                scratchpad.append(&format!("THOUGHT: {thought}"));
                emit(events, EventKind::Thinking, thought).await;
                iterations += 1;
            }

            Ok(ReasonerResult::ToolCall { name, params }) => {
                info!(tool = %name, iteration = iterations, "invoking tool");
                scratchpad.append(&format!("ACTION: use_tool {name}"));
                emit(events, EventKind::ToolCall, format!("{name} {params}")).await;

                shared.set_phase(WorkerPhase::AwaitingTool).await;
                let deadline = Duration::from_secs(limits.tool_timeout_secs);
                let observation = match tools.invoke(&name, params, deadline).await {
                    Ok(result) => result,
                    Err(AgoError::ToolTimeout(tool)) => {
                        warn!(tool = %tool, "tool call timed out");
                        format!("tool '{tool}' timed out after {}s", limits.tool_timeout_secs)
                    }
                    Err(e) => format!("tool error: {e}"),
                };

                scratchpad.append(&format!("TOOL_RESULT: {observation}"));
                emit(events, EventKind::Observation, observation).await;
                iterations += 1;
            }

            Ok(ReasonerResult::FinalAnswer(text)) => {
                shared.set_phase(WorkerPhase::Emitting).await;
                shared
                    .conversation
                    .lock()
                    .await
                    .push(Role::Assistant, text.clone());
                emit(events, EventKind::TurnComplete, text.clone()).await;
                finish_turn(events, text).await;
                return;
            }
        }
    }
}

async fn finish_turn(events: Option<&mpsc::Sender<WorkerReply>>, text: String) {
    if let Some(tx) = events {
        let _ = tx.send(WorkerReply::TurnDone { text }).await;
    }
}
