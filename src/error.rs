//! Error types for the email pipeline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Object store errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Object {bucket}/{key} already exists")]
    AlreadyExists { bucket: String, key: String },

    #[error("Object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Work queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Receipt {receipt} is not valid for queue {queue} (expired or already acknowledged)")]
    UnknownReceipt { queue: String, receipt: Uuid },

    #[error("Message {message_id} on {queue} exhausted {receive_count} deliveries")]
    Exhausted {
        queue: String,
        message_id: Uuid,
        receive_count: u32,
    },

    #[error("Queue {queue} has no dead-letter queue")]
    NoDeadLetterQueue { queue: String },

    #[error("Message body could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Event router errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Invalid event: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("Event is {size} bytes, limit is {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Rule {0} already exists on this bus")]
    DuplicateRule(String),

    #[error("Invalid event pattern: {0}")]
    InvalidPattern(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Request rejected by {provider}: {reason}")]
    Rejected { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether the call may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::InvalidResponse { .. }
        )
    }
}

/// Errors from the generative extraction step.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Input cannot be extracted: {0}")]
    InvalidInput(String),

    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Extraction throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Option<Duration> },

    #[error("Extraction backend unavailable: {0}")]
    Unavailable(String),

    #[error("Extraction returned an unusable result: {0}")]
    InvalidResponse(String),
}

impl ExtractError {
    /// Whether the task should be left for queue redelivery.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidInput(_))
    }
}

impl From<LlmError> for ExtractError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RateLimited { retry_after, .. } => Self::Throttled { retry_after },
            LlmError::InvalidResponse { reason, .. } => Self::InvalidResponse(reason),
            LlmError::Json(e) => Self::InvalidResponse(e.to_string()),
            LlmError::Rejected { reason, .. } => Self::InvalidInput(reason),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Outcome classification for a failed handler invocation.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Malformed input, rejected at the boundary; never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Timeout, throttling or a dependency hiccup; left for redelivery.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Unrecoverable; acknowledged and reported as a diagnostic.
    #[error("Terminal failure: {0}")]
    Terminal(String),
}

impl HandlerError {
    /// Short label for logging and diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transient(_) => "transient",
            Self::Terminal(_) => "terminal",
        }
    }

    /// Whether the message should stay on the queue for redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StorageError> for HandlerError {
    fn from(e: StorageError) -> Self {
        if e.is_transient() {
            Self::Transient(e.to_string())
        } else {
            Self::Terminal(e.to_string())
        }
    }
}

impl From<DatabaseError> for HandlerError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Serialization(_) => Self::Terminal(e.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<ExtractError> for HandlerError {
    fn from(e: ExtractError) -> Self {
        if e.is_transient() {
            Self::Transient(e.to_string())
        } else {
            Self::Terminal(e.to_string())
        }
    }
}

impl From<RouterError> for HandlerError {
    fn from(e: RouterError) -> Self {
        Self::Validation(e.to_string())
    }
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
