use thiserror::Error;

pub type AgoResult<T> = Result<T, AgoError>;

#[derive(Error, Debug)]
pub enum AgoError {
    #[error("No agent matches '{0}'")]
    NoSuchAgent(String),

    #[error("'{name}' is ambiguous, candidates: {}", candidates.join(", "))]
    AmbiguousAgent {
        name: String,
        candidates: Vec<String>,
    },

    #[error("Template '{0}' not found in any layer")]
    NoSuchTemplate(String),

    #[error("Bad template '{name}': field '{field}' {problem}")]
    BadTemplate {
        name: String,
        field: String,
        problem: String,
    },

    #[error("Inbound queue for '{0}' is full")]
    QueueFull(String),

    #[error("Tool '{0}' did not respond within the deadline")]
    ToolTimeout(String),

    #[error("Reasoner output could not be parsed: {0}")]
    ReasonerParse(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("'{0}' is already running")]
    AlreadyRunning(String),

    #[error("'{0}' is not running")]
    NotRunning(String),

    #[error("Socket I/O error: {0}")]
    SocketIo(#[from] std::io::Error),

    #[error("Frame decode failure: {0}")]
    DecodeFailure(String),

    #[error("Instance registry corrupt: {0}")]
    RegistryCorrupt(String),

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker '{0}' crashed")]
    ChildCrashed(String),

    #[error("Could not bind control socket: {0}")]
    BindFailed(String),

    #[error("Base directory inaccessible: {0}")]
    BaseDirInaccessible(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl AgoError {
    /// Stable kind name carried inside error responses so clients can
    /// match on the category without parsing the message text.
    pub fn kind(&self) -> &'static str {
        match self {
            AgoError::NoSuchAgent(_) => "NoSuchAgent",
            AgoError::AmbiguousAgent { .. } => "AmbiguousAgent",
            AgoError::NoSuchTemplate(_) => "NoSuchTemplate",
            AgoError::BadTemplate { .. } => "BadTemplate",
            AgoError::QueueFull(_) => "QueueFull",
            AgoError::ToolTimeout(_) => "ToolTimeout",
            AgoError::ReasonerParse(_) => "ReasonerParseError",
            AgoError::ConfigInvalid(_) => "ConfigInvalid",
            AgoError::AlreadyRunning(_) => "AlreadyRunning",
            AgoError::NotRunning(_) => "NotRunning",
            AgoError::SocketIo(_) => "SocketIO",
            AgoError::DecodeFailure(_) => "DecodeFailure",
            AgoError::RegistryCorrupt(_) => "RegistryCorrupt",
            AgoError::SpawnFailed(_) => "SpawnFailed",
            AgoError::ChildCrashed(_) => "ChildCrashed",
            AgoError::BindFailed(_) => "BindFailed",
            AgoError::BaseDirInaccessible(_) => "BaseDirInaccessible",
            AgoError::Json(_) => "DecodeFailure",
            AgoError::Yaml(_) => "ConfigInvalid",
            AgoError::Http(_) => "SocketIO",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(AgoError::NoSuchAgent("x".into()).kind(), "NoSuchAgent");
        assert_eq!(
            AgoError::AmbiguousAgent {
                name: "helper".into(),
                candidates: vec!["helper-aaaa0000".into()],
            }
            .kind(),
            "AmbiguousAgent"
        );
        assert_eq!(AgoError::NotRunning("a".into()).kind(), "NotRunning");
        assert_eq!(AgoError::QueueFull("a".into()).kind(), "QueueFull");
    }

    #[test]
    fn test_ambiguous_message_lists_candidates() {
        let err = AgoError::AmbiguousAgent {
            name: "researcher".into(),
            candidates: vec!["researcher-a1b2c3d4".into(), "researcher-e5f6a7b8".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("researcher-a1b2c3d4"));
        assert!(msg.contains("researcher-e5f6a7b8"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: AgoError = io.into();
        assert_eq!(err.kind(), "SocketIO");
    }
}
