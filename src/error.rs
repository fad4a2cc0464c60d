use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {id} is {status}; try again when it finishes")]
    TaskBusy { id: String, status: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("external tool was canceled: {tool}")]
    ExternalToolCanceled { tool: String },

    #[error("metadata unavailable for {url}: {reason}")]
    MetadataUnavailable { url: String, reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
