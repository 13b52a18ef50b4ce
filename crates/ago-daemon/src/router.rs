//! Message routing between the client and agents, and agent to agent.
//!
//! Sends are fire-and-forget: the message is queued in the recipient's
//! bounded inbound queue and a per-instance delivery task pushes it to
//! the worker socket with exponential back-off, dead-lettering after the
//! retries are exhausted. Senders never block on delivery.

use crate::home::AgoHome;
use crate::identity::resolve_agent;
use ago_core::{
    read_frame, write_frame, AgoError, AgoResult, InstanceId, Message, Origin, QueueSummary,
    WorkerReply, WorkerRequest,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(2);
const RETRY_ATTEMPTS: u32 = 5;
const DELIVERY_IO_TIMEOUT: Duration = Duration::from_secs(5);
const RECENT_TRAFFIC_WINDOW: usize = 50;

/// One line of recent traffic, also streamed to `queues --follow`
/// subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub from: String,
    pub to: String,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct QueueCounters {
    delivered: AtomicU64,
    dead_lettered: AtomicU64,
}

struct InstanceQueue {
    tx: mpsc::Sender<Message>,
    counters: Arc<QueueCounters>,
    last_payload: Arc<Mutex<Option<String>>>,
    capacity: usize,
    delivery_task: tokio::task::JoinHandle<()>,
}

pub struct MessageRouter {
    home: AgoHome,
    capacity: usize,
    queues: RwLock<HashMap<String, InstanceQueue>>,
    next_message_id: AtomicU64,
    traffic_tx: broadcast::Sender<TrafficRecord>,
    recent: Mutex<VecDeque<TrafficRecord>>,
}

impl MessageRouter {
    pub fn new(home: AgoHome, capacity: usize) -> Self {
        let (traffic_tx, _) = broadcast::channel(64);
        Self {
            home,
            capacity,
            queues: RwLock::new(HashMap::new()),
            next_message_id: AtomicU64::new(1),
            traffic_tx,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Create the bounded queue and delivery task for a new instance.
    pub async fn register_instance(&self, instance_id: &InstanceId) {
        let mut queues = self.queues.write().await;
        if queues.contains_key(instance_id.as_str()) {
            return;
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let counters = Arc::new(QueueCounters::default());
        let last_payload = Arc::new(Mutex::new(None));
        let delivery_task = tokio::spawn(delivery_loop(
            instance_id.clone(),
            self.home.instance_socket(instance_id),
            self.home.dead_letter_log(),
            rx,
            counters.clone(),
        ));

        debug!(instance = %instance_id, capacity = self.capacity, "registered message queue");
        queues.insert(
            instance_id.to_string(),
            InstanceQueue {
                tx,
                counters,
                last_payload,
                capacity: self.capacity,
                delivery_task,
            },
        );
    }

    /// Drop an instance's queue; undelivered messages are abandoned with
    /// the instance.
    pub async fn drop_instance(&self, instance_id: &InstanceId) {
        if let Some(queue) = self.queues.write().await.remove(instance_id.as_str()) {
            queue.delivery_task.abort();
            debug!(instance = %instance_id, "dropped message queue");
        }
    }

    pub async fn registered_ids(&self) -> Vec<InstanceId> {
        self.queues
            .read()
            .await
            .keys()
            .filter_map(|key| InstanceId::parse(key))
            .collect()
    }

    /// Queue a message for `to`. Returns the routed message ID as soon as
    /// the message is enqueued; delivery is the background task's job.
    pub async fn send(&self, from: Origin, to: &str, payload: String) -> AgoResult<u64> {
        let live = self.registered_ids().await;
        let recipient = resolve_agent(&live, to)?;
        if let Origin::Instance(sender) = &from {
            if sender == recipient.as_str() {
                return Err(AgoError::ConfigInvalid(format!(
                    "{sender} cannot send a message to itself"
                )));
            }
        }

        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let message = Message::new(id, from.clone(), recipient.as_str(), payload);

        {
            let queues = self.queues.read().await;
            let queue = queues
                .get(recipient.as_str())
                .ok_or_else(|| AgoError::NoSuchAgent(recipient.to_string()))?;
            queue
                .tx
                .try_send(message.clone())
                .map_err(|_| AgoError::QueueFull(recipient.to_string()))?;
            *queue.last_payload.lock().await = Some(preview(&message.payload));
        }

        self.record_traffic(&message).await;

        // Mirror the outgoing text into the sender's own conversation log
        // so agents remember what they said. Best-effort and off the send
        // path.
        if let Origin::Instance(sender_id) = &from {
            if let Some(sender) = InstanceId::parse(sender_id) {
                let socket = self.home.instance_socket(&sender);
                let to = recipient.to_string();
                let text = message.payload.clone();
                tokio::spawn(async move {
                    if let Err(e) = log_outgoing(&socket, &to, &text).await {
                        warn!(sender = %sender, error = %e, "failed to mirror outgoing message");
                    }
                });
            }
        }

        info!(from = %message.from, to = %recipient, message_id = id, "message queued");
        Ok(id)
    }

    async fn record_traffic(&self, message: &Message) {
        let record = TrafficRecord {
            from: message.from.to_string(),
            to: message.to.clone(),
            preview: preview(&message.payload),
            timestamp: message.timestamp,
        };
        {
            let mut recent = self.recent.lock().await;
            recent.push_back(record.clone());
            while recent.len() > RECENT_TRAFFIC_WINDOW {
                recent.pop_front();
            }
        }
        let _ = self.traffic_tx.send(record);
    }

    pub fn subscribe_traffic(&self) -> broadcast::Receiver<TrafficRecord> {
        self.traffic_tx.subscribe()
    }

    pub async fn recent_traffic(&self) -> Vec<TrafficRecord> {
        self.recent.lock().await.iter().cloned().collect()
    }

    pub async fn queue_summaries(&self) -> Vec<QueueSummary> {
        let queues = self.queues.read().await;
        let mut summaries = Vec::with_capacity(queues.len());
        for (key, queue) in queues.iter() {
            let Some(instance_id) = InstanceId::parse(key) else {
                continue;
            };
            summaries.push(QueueSummary {
                instance_id,
                depth: queue.capacity - queue.tx.capacity(),
                capacity: queue.capacity,
                delivered: queue.counters.delivered.load(Ordering::Relaxed),
                dead_lettered: queue.counters.dead_lettered.load(Ordering::Relaxed),
                last_payload: queue.last_payload.lock().await.clone(),
            });
        }
        summaries.sort_by(|a, b| a.instance_id.as_str().cmp(b.instance_id.as_str()));
        summaries
    }
}

fn preview(payload: &str) -> String {
    const LIMIT: usize = 48;
    if payload.chars().count() <= LIMIT {
        payload.to_string()
    } else {
        let head: String = payload.chars().take(LIMIT).collect();
        format!("{head}...")
    }
}

async fn log_outgoing(socket: &PathBuf, to: &str, text: &str) -> AgoResult<()> {
    let op = async {
        let mut stream = UnixStream::connect(socket).await?;
        write_frame(
            &mut stream,
            &WorkerRequest::LogOutgoing {
                to: to.to_string(),
                message: text.to_string(),
            },
        )
        .await?;
        let _ = read_frame::<_, WorkerReply>(&mut stream).await?;
        Ok(())
    };
    tokio::time::timeout(DELIVERY_IO_TIMEOUT, op)
        .await
        .unwrap_or_else(|_| {
            Err(AgoError::SocketIo(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "log-outgoing timed out",
            )))
        })
}

/// Single consumer per instance: preserves per-sender ordering, retries
/// transport failures with exponential back-off, and dead-letters a
/// message only after the retries are spent.
async fn delivery_loop(
    instance_id: InstanceId,
    socket: PathBuf,
    dead_letter_path: PathBuf,
    mut rx: mpsc::Receiver<Message>,
    counters: Arc<QueueCounters>,
) {
    while let Some(message) = rx.recv().await {
        match deliver_with_backoff(&socket, &message).await {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(instance = %instance_id, message_id = message.id, "delivered");
            }
            Err(e) => {
                counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(
                    instance = %instance_id,
                    message_id = message.id,
                    error = %e,
                    "delivery retries exhausted, dead-lettering"
                );
                if let Err(e) = append_dead_letter(&dead_letter_path, &message).await {
                    warn!(error = %e, "failed to append to dead-letter log");
                }
            }
        }
    }
}

async fn deliver_with_backoff(socket: &PathBuf, message: &Message) -> AgoResult<()> {
    let mut delay = RETRY_BASE;
    let mut last_error = None;

    for attempt in 1..=RETRY_ATTEMPTS {
        match deliver_once(socket, message).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "delivery attempt failed"
                );
                last_error = Some(e);
                if attempt < RETRY_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_CAP);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        AgoError::SocketIo(std::io::Error::new(
            std::io::ErrorKind::Other,
            "delivery failed",
        ))
    }))
}

async fn deliver_once(socket: &PathBuf, message: &Message) -> AgoResult<()> {
    let op = async {
        let mut stream = UnixStream::connect(socket).await?;
        // The payload crosses as plain text; sender and timestamp ride in
        // the envelope, never inlined into what the recipient reads.
        write_frame(
            &mut stream,
            &WorkerRequest::Deliver {
                id: message.id,
                from: message.from.to_string(),
                message: message.payload.clone(),
            },
        )
        .await?;
        match read_frame::<_, WorkerReply>(&mut stream).await? {
            Some(WorkerReply::Ack) => Ok(()),
            Some(WorkerReply::Err { kind, message }) => Err(AgoError::SocketIo(
                std::io::Error::new(std::io::ErrorKind::Other, format!("{kind}: {message}")),
            )),
            other => Err(AgoError::DecodeFailure(format!(
                "unexpected delivery reply: {other:?}"
            ))),
        }
    };
    tokio::time::timeout(DELIVERY_IO_TIMEOUT, op)
        .await
        .unwrap_or_else(|_| {
            Err(AgoError::SocketIo(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "delivery timed out",
            )))
        })
}

async fn append_dead_letter(path: &PathBuf, message: &Message) -> AgoResult<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    async fn router() -> (Arc<MessageRouter>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let home = AgoHome::at(tmp.path().to_path_buf()).unwrap();
        (Arc::new(MessageRouter::new(home, 4)), tmp)
    }

    /// A fake worker that acks every `Deliver` and counts payloads.
    fn fake_worker(
        listener: UnixListener,
    ) -> (Arc<Mutex<Vec<String>>>, tokio::task::JoinHandle<()>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let request = read_frame::<_, WorkerRequest>(&mut stream).await;
                match request {
                    Ok(Some(WorkerRequest::Deliver { message, .. })) => {
                        seen_clone.lock().await.push(message);
                        let _ = write_frame(&mut stream, &WorkerReply::Ack).await;
                    }
                    Ok(Some(WorkerRequest::LogOutgoing { .. })) => {
                        let _ = write_frame(&mut stream, &WorkerReply::Ack).await;
                    }
                    _ => break,
                }
            }
        });
        (seen, task)
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent() {
        let (router, _tmp) = router().await;
        let err = router
            .send(Origin::Client, "ghost-00000000", "hello".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NoSuchAgent");
    }

    #[tokio::test]
    async fn test_send_delivers_plain_payload() {
        let (router, _tmp) = router().await;
        let id = InstanceId::mint("helper");
        let listener = UnixListener::bind(router.home.instance_socket(&id)).unwrap();
        let (seen, _task) = fake_worker(listener);

        router.register_instance(&id).await;
        router
            .send(Origin::Client, id.as_str(), "Organise these findings.".into())
            .await
            .unwrap();

        // Wait for the background delivery.
        for _ in 0..50 {
            if !seen.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let seen = seen.lock().await;
        assert_eq!(seen.as_slice(), ["Organise these findings."]);
    }

    #[tokio::test]
    async fn test_queue_full_when_no_consumer() {
        let (router, _tmp) = router().await;
        let id = InstanceId::mint("slow");
        // No socket bound: deliveries retry slowly, so the queue fills.
        router.register_instance(&id).await;

        let mut result = Ok(0);
        for i in 0..16 {
            result = router
                .send(Origin::Client, id.as_str(), format!("m{i}"))
                .await;
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result.unwrap_err().kind(), "QueueFull");
    }

    #[tokio::test]
    async fn test_messages_delivered_in_order() {
        let (router, _tmp) = router().await;
        let id = InstanceId::mint("ordered");
        let listener = UnixListener::bind(router.home.instance_socket(&id)).unwrap();
        let (seen, _task) = fake_worker(listener);

        router.register_instance(&id).await;
        for i in 0..4 {
            router
                .send(Origin::Client, id.as_str(), format!("m{i}"))
                .await
                .unwrap();
        }

        for _ in 0..100 {
            if seen.lock().await.len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen.lock().await.as_slice(), ["m0", "m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_dead_letter_after_retries() {
        let (router, _tmp) = router().await;
        let id = InstanceId::mint("unreachable");
        router.register_instance(&id).await;
        router
            .send(Origin::Client, id.as_str(), "doomed".into())
            .await
            .unwrap();

        // Retries: 100 + 200 + 400 + 800 ms of back-off, plus slack.
        let dead_letter = router.home.dead_letter_log();
        for _ in 0..120 {
            if dead_letter.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let raw = std::fs::read_to_string(&dead_letter).unwrap();
        let entry: Message = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(entry.payload, "doomed");

        let summaries = router.queue_summaries().await;
        assert_eq!(summaries[0].dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_send_resolves_template_name() {
        let (router, _tmp) = router().await;
        let id = InstanceId::mint("researcher");
        let listener = UnixListener::bind(router.home.instance_socket(&id)).unwrap();
        let (_seen, _task) = fake_worker(listener);
        router.register_instance(&id).await;

        // Friendly name resolves to the single researcher instance.
        router
            .send(Origin::Client, "researcher", "hi".into())
            .await
            .unwrap();

        let second = InstanceId::mint("researcher");
        router.register_instance(&second).await;
        let err = router
            .send(Origin::Client, "researcher", "hi".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "AmbiguousAgent");
    }

    #[tokio::test]
    async fn test_traffic_recorded() {
        let (router, _tmp) = router().await;
        let id = InstanceId::mint("helper");
        let listener = UnixListener::bind(router.home.instance_socket(&id)).unwrap();
        let (_seen, _task) = fake_worker(listener);
        router.register_instance(&id).await;

        let mut rx = router.subscribe_traffic();
        router
            .send(Origin::Client, id.as_str(), "ping".into())
            .await
            .unwrap();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.from, "client");
        assert_eq!(record.to, id.to_string());
        assert_eq!(router.recent_traffic().await.len(), 1);
    }
}
