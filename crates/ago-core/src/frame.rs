//! Length-prefixed binary framing for all Unix-domain socket traffic.
//!
//! Every frame is a big-endian u32 byte length followed by that many bytes
//! of bincode-encoded record. No newline or JSON-boundary sniffing: frame
//! boundaries are exact, and large payloads (up to [`MAX_FRAME_LEN`]) pass
//! through untouched.

use crate::error::{AgoError, AgoResult};
use crate::instance::{InstanceId, InstanceState};
use crate::message::ConversationEntry;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames must be accepted up to at least 16 MiB of payload; the cap
/// leaves headroom for the record envelope around it.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

// --- Control protocol: client <-> daemon ---

/// A command sent to the daemon control socket. Closed union with static
/// dispatch in the control server; one request per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    /// Materialise a template's runtime file into the pulled layer.
    /// Does not spawn anything.
    Create { template: String },
    /// Spawn a worker for the template and return its instance ID.
    Run { template: String },
    Ps,
    Inspect { agent: String },
    /// Stream one user turn to a worker; the connection is upgraded to an
    /// event stream terminated by a final `Response`.
    Chat { agent: String, message: String },
    /// Enqueue an inter-agent message. Returns as soon as the message is
    /// queued; delivery happens in the background.
    Send {
        from: String,
        to: String,
        message: String,
    },
    Logs {
        agent: String,
        tail: Option<usize>,
        follow: bool,
    },
    Stop { agent: Option<String>, all: bool },
    Queues { follow: bool },
    Templates,
    /// `registry:template` reference, e.g. `community:writer`.
    Pull { reference: String },
    ConfigGet { key: String },
    ConfigSet {
        key: String,
        value: String,
        project: bool,
    },
    ConfigShow,
    RegistryAdd {
        name: String,
        url: String,
        kind: String,
        token: Option<String>,
        priority: u32,
    },
    RegistryList,
    RegistryRemove { name: String },
    /// A freshly spawned worker announcing its socket is up.
    RegisterWorker { instance_id: InstanceId },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub payload: Payload,
}

impl Response {
    pub fn ok(payload: Payload) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    pub fn error(err: &AgoError) -> Self {
        Self {
            status: Status::Error,
            payload: Payload::Error {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Text(String),
    Started { instance_id: InstanceId },
    Instances(Vec<InstanceSummary>),
    Instance(InstanceDetail),
    Logs(Vec<ConversationEntry>),
    Templates(Vec<TemplateSummary>),
    Queues(Vec<QueueSummary>),
    Registries(Vec<RegistrySummary>),
    Error { kind: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub instance_id: InstanceId,
    pub template: String,
    pub model: String,
    pub state: InstanceState,
    pub pid: u32,
    pub spawned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDetail {
    pub summary: InstanceSummary,
    pub socket_path: String,
    pub log_path: String,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSummary {
    pub name: String,
    pub version: String,
    pub description: String,
    pub model: String,
    /// Which discovery layer the winning copy came from.
    pub layer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub instance_id: InstanceId,
    pub depth: usize,
    pub capacity: usize,
    pub delivered: u64,
    pub dead_lettered: u64,
    pub last_payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub name: String,
    pub url: String,
    pub kind: String,
    pub priority: u32,
    pub enabled: bool,
}

/// A record pushed to a client while a streaming operation is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Thinking,
    ToolCall,
    Observation,
    TurnComplete,
    TurnTruncated,
    Log,
    Queue,
    Error,
}

impl Event {
    pub fn new(kind: EventKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Top-level record on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Request(Request),
    Response(Response),
    Event(Event),
}

// --- Worker protocol: daemon <-> per-instance socket ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerRequest {
    Ping,
    /// One user turn. The worker streams `WorkerReply::Event` frames on
    /// the same connection and finishes with `WorkerReply::TurnDone`.
    Chat { message: String },
    /// An inter-agent message delivered by the router. `id` is the routed
    /// message ID so re-deliveries can be dropped.
    Deliver {
        id: u64,
        from: String,
        message: String,
    },
    /// Mirror an outgoing message into this (the sender's) own
    /// conversation log.
    LogOutgoing { to: String, message: String },
    History { tail: Option<usize> },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerReply {
    Pong { state: InstanceState },
    Ack,
    History { entries: Vec<ConversationEntry> },
    Event(Event),
    TurnDone { text: String },
    Err { kind: String, message: String },
}

// --- Codec ---

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> AgoResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| AgoError::DecodeFailure(format!("encode: {e}")))?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(AgoError::DecodeFailure(format!(
            "frame of {} bytes exceeds the {} byte cap",
            bytes.len(),
            MAX_FRAME_LEN
        )));
    }
    let len = bytes.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the peer closed cleanly at a
/// frame boundary; a close mid-frame or a malformed length is a
/// `DecodeFailure` and the caller drops the connection.
pub async fn read_frame<R, T>(r: &mut R) -> AgoResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(AgoError::DecodeFailure(format!(
            "declared frame length {len} exceeds the {MAX_FRAME_LEN} byte cap"
        )));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)
        .await
        .map_err(|e| AgoError::DecodeFailure(format!("short read inside frame: {e}")))?;
    let (val, _) = bincode::serde::decode_from_slice(&data, bincode::config::standard())
        .map_err(|e| AgoError::DecodeFailure(format!("decode: {e}")))?;
    Ok(Some(val))
}
