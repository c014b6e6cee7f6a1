//! Error types for rangemover

use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Result type alias for rangemover operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for rangemover
#[derive(Debug)]
pub enum Error {
    /// Object store errors
    ObjectStore(object_store::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Network or timeout failure while cloning; retried with backoff
    TransientCloner(String),
    /// Cloning gave up (collection dropped, attempts exhausted, cancelled)
    ClonerAborted(String),
    /// Routing table changed underneath a commit attempt
    EpochConflict { expected: u64, actual: u64 },
    /// Commit response was lost; must be resolved by outcome lookup
    AmbiguousCommitOutcome(String),
    /// Deletion task no longer matches the live collection generation
    StaleDeletionTask { task_id: String, reason: String },
    /// A bounded operation ran past its deadline
    DeadlineExceeded { operation: &'static str, limit: Duration },
    /// Namespace does not exist on the shard or in the routing catalog
    NamespaceNotFound(String),
    /// Namespace was dropped and recreated under a new generation
    CollectionUuidMismatch {
        namespace: String,
        expected: Uuid,
        actual: Uuid,
    },
    /// Change log no longer holds entries after `since`; the oldest kept is `oldest`
    ChangeLogTruncated { since: u64, oldest: u64 },
    /// Shard is not part of the directory
    ShardNotFound(String),
    /// Key is now owned by another shard
    ShardMoved { new_location: String, epoch: u64 },
    /// Another migration already covers an overlapping range
    MigrationConflict(String),
    /// Critical-section waiter queue is full
    WriteQueueFull { namespace: String },
    /// Operation was cancelled by the caller
    Cancelled,
    /// Storage engine failure that may succeed on retry
    Storage(String),
    /// Metadata conflict (CAS failure)
    Conflict,
    /// Too many retries
    TooManyRetries,
    /// Internal error
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientCloner(_)
                | Error::Storage(_)
                | Error::Io(_)
                | Error::ObjectStore(_)
                | Error::Conflict
                | Error::AmbiguousCommitOutcome(_)
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::TransientCloner(msg) => write!(f, "Transient cloner error: {}", msg),
            Error::ClonerAborted(msg) => write!(f, "Cloner aborted: {}", msg),
            Error::EpochConflict { expected, actual } => {
                write!(f, "Epoch conflict: expected {}, got {}", expected, actual)
            }
            Error::AmbiguousCommitOutcome(msg) => {
                write!(f, "Ambiguous commit outcome: {}", msg)
            }
            Error::StaleDeletionTask { task_id, reason } => {
                write!(f, "Stale range deletion task {}: {}", task_id, reason)
            }
            Error::DeadlineExceeded { operation, limit } => {
                write!(f, "Deadline exceeded for {} after {:?}", operation, limit)
            }
            Error::NamespaceNotFound(ns) => write!(f, "Namespace not found: {}", ns),
            Error::CollectionUuidMismatch {
                namespace,
                expected,
                actual,
            } => write!(
                f,
                "Collection {} has uuid {}, expected {}",
                namespace, actual, expected
            ),
            Error::ChangeLogTruncated { since, oldest } => write!(
                f,
                "Change log truncated: requested changes after {}, oldest kept is {}",
                since, oldest
            ),
            Error::ShardNotFound(shard_id) => write!(f, "Shard not found: {}", shard_id),
            Error::ShardMoved {
                new_location,
                epoch,
            } => write!(f, "Shard moved to: {} (epoch {})", new_location, epoch),
            Error::MigrationConflict(msg) => write!(f, "Migration conflict: {}", msg),
            Error::WriteQueueFull { namespace } => {
                write!(f, "Critical section write queue is full for {}", namespace)
            }
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
            Error::Conflict => write!(f, "Metadata conflict: concurrent modification detected"),
            Error::TooManyRetries => write!(
                f,
                "Too many retries: operation failed after maximum retry attempts"
            ),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
