use thiserror::Error;

/// Core error type for the Synapse engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Input failed validation (out-of-range score, malformed payload)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A template-required variable was not supplied
    #[error("Missing template variable: {0}")]
    MissingVariable(String),

    /// Edge endpoints are identical or live in different owner scopes
    #[error("Invalid edge scope: {0}")]
    InvalidEdgeScope(String),

    /// Append or close attempted on a session that is no longer open
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Session open attempted on an instance that is not active or busy
    #[error("Instance not active: {0}")]
    InstanceNotActive(String),

    /// State machine transition not permitted from the current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Entity not found
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind
        entity: String,
        /// Identifier that was looked up
        id: String,
    },

    /// Model call exceeded its deadline
    #[error("External timeout: {0}")]
    ExternalTimeout(String),

    /// Model call failed
    #[error("External error: {0}")]
    ExternalError(String),

    /// Storage layer could not complete the operation
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Helper to create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// True for errors a caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ExternalTimeout(_) | CoreError::StorageUnavailable(_)
        )
    }
}

/// Error type for the storage layer.
///
/// `VersionConflict` and `DuplicateKey` are optimistic-concurrency signals;
/// services retry on them and never hand them to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Version conflict on {entity} {id}: expected {expected}, found {found}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },
    #[error("Duplicate key for {entity}: {key}")]
    DuplicateKey { entity: &'static str, key: String },
    #[error("Data mapping error: {0}")]
    MappingError(String),
}

impl StorageError {
    /// Whether this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::VersionConflict { .. } | StorageError::DuplicateKey { .. }
        )
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => CoreError::StorageUnavailable(msg),
            StorageError::MappingError(msg) => CoreError::SerializationError(msg),
            conflict => CoreError::Other(format!("unresolved storage conflict: {}", conflict)),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::ConfigurationError(err.to_string())
    }
}

/// Result alias used across the engine
pub type CoreResult<T> = Result<T, CoreError>;

/// Result alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
