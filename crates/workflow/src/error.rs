use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("store error: {0}")]
    Store(#[from] waypoint_store::StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("project probe failed: {0}")]
    Probe(String),

    #[error("unknown action: {id}")]
    UnknownAction { id: String },

    #[error("interruption stack is empty")]
    EmptyInterruptionStack,

    #[error("context not found: {id}")]
    ContextNotFound { id: String },

    #[error("{selector} selection failed for '{id}': {detail}")]
    SelectorFailed {
        selector: &'static str,
        id: String,
        detail: String,
    },
}
