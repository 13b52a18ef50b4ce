pub mod error;
pub mod frame;
pub mod instance;
pub mod message;

pub use error::{AgoError, AgoResult};
pub use frame::{
    read_frame, write_frame, Event, EventKind, Frame, InstanceDetail, InstanceSummary, Payload,
    QueueSummary, RegistrySummary, Request, Response, Status, TemplateSummary, WorkerReply,
    WorkerRequest, MAX_FRAME_LEN,
};
pub use instance::{InstanceId, InstanceRecord, InstanceState};
pub use message::{ConversationEntry, Message, MessageKind, Origin, Role};
