use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutodError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Slot not assigned: {0}")]
    SlotUnassigned(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node {node_id} at {address} unavailable: {cause}")]
    DownstreamUnavailable {
        node_id: String,
        address: String,
        cause: String,
    },

    #[error("Failed to spawn handler {handler}: {source}")]
    SpawnFailed {
        handler: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Scan already running")]
    ScanAlreadyRunning,

    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AutodError {
    /// Short machine-readable tag used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AutodError::Validation(_) => "validation",
            AutodError::SlotUnassigned(_) => "slot_unassigned",
            AutodError::NodeNotFound(_) => "node_not_found",
            AutodError::DownstreamUnavailable { .. } => "downstream_unavailable",
            AutodError::SpawnFailed { .. } => "spawn_failed",
            AutodError::ScanAlreadyRunning => "already_running",
            AutodError::Remote { .. } => "remote",
            AutodError::Config(_) => "config",
            AutodError::Io(_) => "io",
            AutodError::Http(_) => "http",
        }
    }
}

pub type Result<T> = std::result::Result<T, AutodError>;
