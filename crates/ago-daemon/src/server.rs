//! The daemon control socket: one `Request` per connection, one
//! `Response` back, with chat / log-follow / queue-follow upgrading the
//! connection to an event stream terminated by a final `Response`.

use crate::daemon::DaemonState;
use crate::identity::resolve_agent;
use ago_core::{
    read_frame, write_frame, AgoError, AgoResult, ConversationEntry, Event, EventKind, Frame,
    InstanceId, Origin, Payload, RegistrySummary, Request, Response, WorkerReply, WorkerRequest,
};
use ago_config::ConfigScope;
use ago_registry::pull_template;
use ago_worker::ToolServerConfig;
use chrono::{DateTime, Utc};
use serde_yaml_ng::{Mapping, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const FOLLOW_POLL: Duration = Duration::from_secs(1);

pub struct ControlServer;

impl ControlServer {
    pub async fn run(
        state: Arc<DaemonState>,
        listener: UnixListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> AgoResult<()> {
        info!("control server accepting connections");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                handle_connection(state, stream).await;
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed on control socket"),
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        info!("control server stopped");
        Ok(())
    }
}

async fn handle_connection(state: Arc<DaemonState>, mut stream: UnixStream) {
    let request = match read_frame::<_, Frame>(&mut stream).await {
        Ok(Some(Frame::Request(request))) => request,
        Ok(Some(other)) => {
            debug!(frame = ?other, "dropping non-request frame");
            return;
        }
        Ok(None) => return,
        Err(e) => {
            // Malformed length or body: answer if we still can, then drop.
            let _ = write_frame(&mut stream, &Frame::Response(Response::error(&e))).await;
            return;
        }
    };

    debug!(request = request_name(&request), "dispatching");
    match request {
        // Streaming operations write their own event sequence.
        Request::Chat { agent, message } => handle_chat(&state, agent, message, &mut stream).await,
        Request::Logs {
            agent,
            tail,
            follow: true,
        } => handle_logs_follow(&state, agent, tail, &mut stream).await,
        Request::Queues { follow: true } => handle_queues_follow(&state, &mut stream).await,

        // Everything else is strict request/response.
        other => {
            let response = match dispatch(&state, other).await {
                Ok(payload) => Response::ok(payload),
                Err(e) => {
                    warn!(error = %e, "request failed");
                    Response::error(&e)
                }
            };
            let _ = write_frame(&mut stream, &Frame::Response(response)).await;
        }
    }
}

fn request_name(request: &Request) -> &'static str {
    match request {
        Request::Ping => "ping",
        Request::Create { .. } => "create",
        Request::Run { .. } => "run",
        Request::Ps => "ps",
        Request::Inspect { .. } => "inspect",
        Request::Chat { .. } => "chat",
        Request::Send { .. } => "send",
        Request::Logs { .. } => "logs",
        Request::Stop { .. } => "stop",
        Request::Queues { .. } => "queues",
        Request::Templates => "templates",
        Request::Pull { .. } => "pull",
        Request::ConfigGet { .. } => "config-get",
        Request::ConfigSet { .. } => "config-set",
        Request::ConfigShow => "config-show",
        Request::RegistryAdd { .. } => "registry-add",
        Request::RegistryList => "registry-list",
        Request::RegistryRemove { .. } => "registry-remove",
        Request::RegisterWorker { .. } => "register-worker",
        Request::Shutdown => "shutdown",
    }
}

async fn dispatch(state: &Arc<DaemonState>, request: Request) -> AgoResult<Payload> {
    match request {
        Request::Ping => Ok(Payload::Text("pong".into())),

        Request::Create { template } => {
            let registry = state.templates();
            let (resolved, layer) = registry.resolve(&template)?;
            let rendered = serde_yaml_ng::to_string(&resolved)?;
            let path = registry.install_pulled(&rendered, &resolved.name)?;
            info!(template = %template, from_layer = %layer, "materialised template");
            Ok(Payload::Text(path.display().to_string()))
        }

        Request::Run { template } => {
            let registry = state.templates();
            let (resolved, _) = registry.resolve(&template)?;
            let model = resolved
                .model
                .clone()
                .unwrap_or_else(|| state.config.default_model());
            let limits = state.config.worker_limits();
            let tool_servers: Vec<ToolServerConfig> =
                serde_yaml_ng::from_value(state.config.tool_servers()).unwrap_or_default();

            let instance_id = state
                .manager
                .spawn(resolved, model, limits, tool_servers)
                .await?;
            state.router.register_instance(&instance_id).await;
            Ok(Payload::Started { instance_id })
        }

        Request::Ps => Ok(Payload::Instances(state.manager.list().await)),

        Request::Inspect { agent } => {
            let id = resolve_live(state, &agent).await?;
            Ok(Payload::Instance(state.manager.detail(&id).await?))
        }

        Request::Send { from, to, message } => {
            let origin = if from == "client" {
                Origin::Client
            } else {
                let id = resolve_live(state, &from).await?;
                Origin::Instance(id.to_string())
            };
            let message_id = state.router.send(origin, &to, message).await?;
            Ok(Payload::Text(format!("message {message_id} queued")))
        }

        Request::Logs {
            agent,
            tail,
            follow: false,
        } => {
            let id = resolve_live(state, &agent).await?;
            let socket = state.manager.socket_for(&id).await?;
            let entries = fetch_history(&socket, tail).await?;
            Ok(Payload::Logs(entries))
        }
        Request::Logs { follow: true, .. } => unreachable!("handled as a stream"),
        Request::Chat { .. } => unreachable!("handled as a stream"),
        Request::Queues { follow: true } => unreachable!("handled as a stream"),

        Request::Stop { agent, all } => {
            if all {
                let stopped = state.manager.stop_all().await;
                for id in &stopped {
                    state.router.drop_instance(id).await;
                }
                return Ok(Payload::Text(format!("stopped {} instance(s)", stopped.len())));
            }
            let name = agent
                .ok_or_else(|| AgoError::ConfigInvalid("stop needs an agent or --all".into()))?;
            // A name that no longer matches anything is "not running",
            // not an escalation: stop is idempotent from the CLI's side.
            let id = match resolve_live(state, &name).await {
                Ok(id) => id,
                Err(AgoError::NoSuchAgent(_)) => return Err(AgoError::NotRunning(name)),
                Err(other) => return Err(other),
            };
            state.manager.stop(&id).await?;
            state.router.drop_instance(&id).await;
            Ok(Payload::Text(format!("{id} stopped")))
        }

        Request::Queues { follow: false } => {
            Ok(Payload::Queues(state.router.queue_summaries().await))
        }

        Request::Templates => Ok(Payload::Templates(state.templates().list())),

        Request::Pull { reference } => {
            let registry = state.templates();
            let (name, path) = pull_template(
                &state.config.registries(),
                state.fetcher.as_ref(),
                &registry,
                &reference,
            )
            .await?;
            Ok(Payload::Text(format!("{name} -> {}", path.display())))
        }

        Request::ConfigGet { key } => state
            .config
            .get_rendered(&key)
            .map(Payload::Text)
            .ok_or_else(|| AgoError::ConfigInvalid(format!("no such key '{key}'"))),

        Request::ConfigSet {
            key,
            value,
            project,
        } => {
            let scope = if project {
                ConfigScope::Project
            } else {
                ConfigScope::Global
            };
            state.config.set(scope, &key, &value)?;
            Ok(Payload::Empty)
        }

        Request::ConfigShow => Ok(Payload::Text(state.config.render_all()?)),

        Request::RegistryAdd {
            name,
            url,
            kind,
            token,
            priority,
        } => {
            if name.is_empty() || name.contains('.') {
                return Err(AgoError::ConfigInvalid(format!(
                    "invalid registry name '{name}'"
                )));
            }
            if !matches!(kind.as_str(), "builtin" | "http" | "github" | "gitlab") {
                return Err(AgoError::ConfigInvalid(format!(
                    "unknown registry kind '{kind}'"
                )));
            }
            let mut entry = Mapping::new();
            entry.insert("url".into(), Value::String(url));
            entry.insert("kind".into(), Value::String(kind));
            if let Some(token) = token {
                entry.insert("token".into(), Value::String(token));
            }
            entry.insert("priority".into(), Value::from(priority as u64));
            entry.insert("enabled".into(), Value::Bool(true));
            state.config.set_value(
                ConfigScope::Global,
                &format!("registries.{name}"),
                Value::Mapping(entry),
            )?;
            Ok(Payload::Empty)
        }

        Request::RegistryList => {
            let registries = state
                .config
                .registries()
                .into_iter()
                .map(|r| RegistrySummary {
                    name: r.name,
                    url: r.url,
                    kind: r.kind.to_string(),
                    priority: r.priority,
                    enabled: r.enabled,
                })
                .collect();
            Ok(Payload::Registries(registries))
        }

        Request::RegistryRemove { name } => {
            state
                .config
                .unset(ConfigScope::Global, &format!("registries.{name}"))?;
            Ok(Payload::Empty)
        }

        Request::RegisterWorker { instance_id } => {
            state.manager.mark_ready(&instance_id).await?;
            Ok(Payload::Empty)
        }

        Request::Shutdown => {
            info!("shutdown requested by client");
            let _ = state.shutdown_tx.send(true);
            Ok(Payload::Text("daemon stopping".into()))
        }
    }
}

async fn resolve_live(state: &Arc<DaemonState>, name: &str) -> AgoResult<InstanceId> {
    let live = state.manager.live_ids().await;
    resolve_agent(&live, name)
}

// --- Streaming handlers ---

/// Proxy one user turn to the worker, relaying its events until
/// `turn-complete` (or an error) and finishing with a `Response`.
async fn handle_chat(
    state: &Arc<DaemonState>,
    agent: String,
    message: String,
    client: &mut UnixStream,
) {
    let result = chat_inner(state, &agent, message, client).await;
    if let Err(e) = result {
        let _ = write_frame(
            client,
            &Frame::Event(Event::new(EventKind::Error, e.to_string())),
        )
        .await;
        let _ = write_frame(client, &Frame::Response(Response::error(&e))).await;
    }
}

async fn chat_inner(
    state: &Arc<DaemonState>,
    agent: &str,
    message: String,
    client: &mut UnixStream,
) -> AgoResult<()> {
    let id = resolve_live(state, agent).await?;
    let socket = state.manager.socket_for(&id).await?;

    let mut worker = UnixStream::connect(&socket)
        .await
        .map_err(|_| AgoError::ChildCrashed(id.to_string()))?;
    write_frame(&mut worker, &WorkerRequest::Chat { message }).await?;

    let mut client_gone = false;
    loop {
        match read_frame::<_, WorkerReply>(&mut worker).await {
            Ok(Some(WorkerReply::Event(event))) => {
                if !client_gone
                    && write_frame(client, &Frame::Event(event)).await.is_err()
                {
                    // The client went away; the worker finishes its turn
                    // regardless and we discard the rest of the stream.
                    debug!(instance = %id, "chat client disconnected mid-stream");
                    client_gone = true;
                }
            }
            Ok(Some(WorkerReply::TurnDone { text })) => {
                if !client_gone {
                    let _ = write_frame(
                        client,
                        &Frame::Response(Response::ok(Payload::Text(text))),
                    )
                    .await;
                }
                return Ok(());
            }
            Ok(Some(WorkerReply::Err { kind, message })) => {
                if !client_gone {
                    let response = Response {
                        status: ago_core::Status::Error,
                        payload: Payload::Error { kind, message },
                    };
                    let _ = write_frame(client, &Frame::Response(response)).await;
                }
                return Ok(());
            }
            Ok(Some(other)) => {
                return Err(AgoError::DecodeFailure(format!(
                    "unexpected chat reply: {other:?}"
                )));
            }
            Ok(None) | Err(_) => {
                // Worker hung up mid-turn.
                return Err(AgoError::ChildCrashed(id.to_string()));
            }
        }
    }
}

async fn fetch_history(
    socket: &std::path::Path,
    tail: Option<usize>,
) -> AgoResult<Vec<ConversationEntry>> {
    let mut stream = UnixStream::connect(socket).await?;
    write_frame(&mut stream, &WorkerRequest::History { tail }).await?;
    match read_frame::<_, WorkerReply>(&mut stream).await? {
        Some(WorkerReply::History { entries }) => Ok(entries),
        other => Err(AgoError::DecodeFailure(format!(
            "unexpected history reply: {other:?}"
        ))),
    }
}

/// Tail-follow a worker's conversation log: emit what exists, then poll
/// for entries newer than the last one seen.
async fn handle_logs_follow(
    state: &Arc<DaemonState>,
    agent: String,
    tail: Option<usize>,
    client: &mut UnixStream,
) {
    let id = match resolve_live(state, &agent).await {
        Ok(id) => id,
        Err(e) => {
            let _ = write_frame(client, &Frame::Response(Response::error(&e))).await;
            return;
        }
    };

    let mut last_seen: Option<DateTime<Utc>> = None;
    let socket = match state.manager.socket_for(&id).await {
        Ok(socket) => socket,
        Err(e) => {
            let _ = write_frame(client, &Frame::Response(Response::error(&e))).await;
            return;
        }
    };

    match fetch_history(&socket, tail).await {
        Ok(entries) => {
            for entry in &entries {
                last_seen = Some(entry.timestamp);
                if emit_log_entry(client, entry).await.is_err() {
                    return;
                }
            }
        }
        Err(e) => {
            let _ = write_frame(client, &Frame::Response(Response::error(&e))).await;
            return;
        }
    }

    loop {
        tokio::time::sleep(FOLLOW_POLL).await;
        let entries = match fetch_history(&socket, None).await {
            Ok(entries) => entries,
            Err(_) => {
                // The instance died while we were following.
                let e = AgoError::ChildCrashed(id.to_string());
                let _ = write_frame(
                    client,
                    &Frame::Event(Event::new(EventKind::Error, e.to_string())),
                )
                .await;
                let _ = write_frame(client, &Frame::Response(Response::error(&e))).await;
                return;
            }
        };
        for entry in &entries {
            if last_seen.is_some_and(|seen| entry.timestamp <= seen) {
                continue;
            }
            last_seen = Some(entry.timestamp);
            if emit_log_entry(client, entry).await.is_err() {
                return;
            }
        }
    }
}

async fn emit_log_entry(client: &mut UnixStream, entry: &ConversationEntry) -> AgoResult<()> {
    let payload = serde_json::to_string(entry)?;
    write_frame(client, &Frame::Event(Event::new(EventKind::Log, payload))).await
}

/// Stream queue traffic: recent records first, then live ones as they
/// happen, until the client goes away.
async fn handle_queues_follow(state: &Arc<DaemonState>, client: &mut UnixStream) {
    for record in state.router.recent_traffic().await {
        let Ok(payload) = serde_json::to_string(&record) else {
            continue;
        };
        if write_frame(client, &Frame::Event(Event::new(EventKind::Queue, payload)))
            .await
            .is_err()
        {
            return;
        }
    }

    let mut rx = state.router.subscribe_traffic();
    loop {
        match rx.recv().await {
            Ok(record) => {
                let Ok(payload) = serde_json::to_string(&record) else {
                    continue;
                };
                if write_frame(client, &Frame::Event(Event::new(EventKind::Queue, payload)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "queue follower lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                let _ = write_frame(
                    client,
                    &Frame::Response(Response::ok(Payload::Empty)),
                )
                .await;
                return;
            }
        }
    }
}
