use thiserror::Error;

/// Primary error type for fabric operations.
///
/// Every variant maps onto one of the three commit outcomes through
/// [`FabricError::status`], so callers of a transaction can decide between
/// retrying, giving up, or waiting for a reconnection without matching on
/// individual variants.
#[derive(Error, Debug)]
pub enum FabricError {
    // === Transaction Errors ===
    /// Optimistic validation found a read that was overwritten by a
    /// concurrent commit.
    #[error("conflict on branch {branch}{}", object_suffix(.object))]
    Conflict { branch: u64, object: Option<u64> },

    /// The caller aborted the transaction.
    #[error("transaction aborted: {reason}")]
    Aborted { reason: String },

    /// The branch is blocked because its connection went away.
    #[error("branch {branch} disconnected: {cause}")]
    Disconnected { branch: u64, cause: String },

    /// An external authority rejected an intercepted commit.
    #[error("interception {interception} on branch {branch} rejected: {cause}")]
    Nacked {
        branch: u64,
        interception: u64,
        cause: String,
    },

    /// The transaction started before versions it needs were merged away.
    #[error("snapshot too old: transaction started at {start}, branch base is {base}")]
    SnapshotTooOld { start: u64, base: u64 },

    /// Transaction is not in a state that allows the operation.
    #[error("invalid transaction state: {0}")]
    InvalidState(String),

    /// User supplied code (key `Eq`/`Hash`, call handlers) panicked.
    #[error("user code failed: {detail}")]
    UserCode { detail: String },

    // === Protocol Errors ===
    /// Malformed or out-of-order wire data.
    #[error("protocol violation: {detail}")]
    Protocol { detail: String },

    /// Unknown command byte for a protocol layer.
    #[error("unknown {layer} command {command}")]
    UnknownCommand { layer: &'static str, command: u8 },

    /// Validator rejected a remote read, write or method call.
    #[error("validation failed: {detail}")]
    Validation { detail: String },

    /// The connection was closed while the operation was outstanding.
    #[error("connection closed: {cause}")]
    ConnectionClosed { cause: String },

    /// A method call future was cancelled.
    #[error("call cancelled")]
    Cancelled,

    // === Model Errors ===
    /// The object model has no class for the id.
    #[error("no such class: {class_id}")]
    ClassNotFound { class_id: i32 },

    /// Field or element index outside the class shape.
    #[error("field {index} out of range for class {class_id} ({count} fields)")]
    FieldOutOfRange {
        class_id: i32,
        index: u32,
        count: u32,
    },

    /// Operation does not apply to this kind of object.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    // === Configuration / Internal ===
    /// Invalid configuration value.
    #[error("invalid configuration: {detail}")]
    Config { detail: String },

    /// I/O error from a transport or store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

fn object_suffix(object: &Option<u64>) -> String {
    object.map(|o| format!(" (object {o})")).unwrap_or_default()
}

/// Outcome classes of a commit attempt.
///
/// Conflicts are retryable; aborts are not (a user abort needs nothing, a
/// disconnection abort needs the branch to reconnect first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitStatus {
    /// The commit is durable on the branch.
    Committed,
    /// Retry the transaction from scratch.
    Conflict,
    /// The transaction is gone; retrying will not help.
    Abort,
}

/// Stable numeric codes, used in nack payloads and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    Conflict = 1,
    Abort = 2,
    Disconnected = 3,
    Protocol = 4,
    Validation = 5,
    Closed = 6,
    Model = 7,
    Config = 8,
    IoErr = 9,
    Internal = 10,
}

impl ErrorCode {
    /// Parse a wire code; `None` for unknown values.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Ok,
            1 => Self::Conflict,
            2 => Self::Abort,
            3 => Self::Disconnected,
            4 => Self::Protocol,
            5 => Self::Validation,
            6 => Self::Closed,
            7 => Self::Model,
            8 => Self::Config,
            9 => Self::IoErr,
            10 => Self::Internal,
            _ => return None,
        })
    }

    /// Commit status a nack with this code resolves to.
    #[must_use]
    pub const fn status(self) -> CommitStatus {
        match self {
            Self::Ok => CommitStatus::Committed,
            Self::Conflict => CommitStatus::Conflict,
            _ => CommitStatus::Abort,
        }
    }
}

impl FabricError {
    /// Map this error to a stable numeric code.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Conflict { .. } | Self::SnapshotTooOld { .. } | Self::UserCode { .. } => {
                ErrorCode::Conflict
            }
            Self::Nacked { .. } => ErrorCode::Conflict,
            Self::Aborted { .. } | Self::Cancelled => ErrorCode::Abort,
            Self::Disconnected { .. } => ErrorCode::Disconnected,
            Self::Protocol { .. } | Self::UnknownCommand { .. } => ErrorCode::Protocol,
            Self::Validation { .. } => ErrorCode::Validation,
            Self::ConnectionClosed { .. } => ErrorCode::Closed,
            Self::ClassNotFound { .. }
            | Self::FieldOutOfRange { .. }
            | Self::TypeMismatch { .. } => ErrorCode::Model,
            Self::Config { .. } => ErrorCode::Config,
            Self::Io(_) => ErrorCode::IoErr,
            Self::InvalidState(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Commit status this error represents.
    #[must_use]
    pub const fn status(&self) -> CommitStatus {
        self.error_code().status()
    }

    /// Whether re-running the transaction may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self.status(), CommitStatus::Conflict)
    }

    /// Whether this error closes the connection it was raised on.
    pub const fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::UnknownCommand { .. }
                | Self::Validation { .. }
                | Self::Io(_)
                | Self::Internal(_)
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Conflict { .. } | Self::Nacked { .. } | Self::UserCode { .. } => {
                Some("Retry the transaction; the conflict is transient")
            }
            Self::SnapshotTooOld { .. } => Some("Start a new transaction to get a fresh snapshot"),
            Self::Disconnected { .. } => Some("Wait for the branch to reconnect before retrying"),
            Self::ClassNotFound { .. } => Some("Register the class with the object model"),
            _ => None,
        }
    }

    /// Create a conflict error.
    pub fn conflict(branch: u64, object: Option<u64>) -> Self {
        Self::Conflict { branch, object }
    }

    /// Create a protocol violation.
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }

    /// Create a connection-closed error.
    pub fn closed(cause: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            cause: cause.into(),
        }
    }

    /// Duplicate an error for fan-out to several waiters.
    ///
    /// `std::io::Error` is not `Clone`; it is re-created from its kind and
    /// message.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Conflict { branch, object } => Self::Conflict {
                branch: *branch,
                object: *object,
            },
            Self::Aborted { reason } => Self::Aborted {
                reason: reason.clone(),
            },
            Self::Disconnected { branch, cause } => Self::Disconnected {
                branch: *branch,
                cause: cause.clone(),
            },
            Self::Nacked {
                branch,
                interception,
                cause,
            } => Self::Nacked {
                branch: *branch,
                interception: *interception,
                cause: cause.clone(),
            },
            Self::SnapshotTooOld { start, base } => Self::SnapshotTooOld {
                start: *start,
                base: *base,
            },
            Self::InvalidState(msg) => Self::InvalidState(msg.clone()),
            Self::UserCode { detail } => Self::UserCode {
                detail: detail.clone(),
            },
            Self::Protocol { detail } => Self::Protocol {
                detail: detail.clone(),
            },
            Self::UnknownCommand { layer, command } => Self::UnknownCommand {
                layer: *layer,
                command: *command,
            },
            Self::Validation { detail } => Self::Validation {
                detail: detail.clone(),
            },
            Self::ConnectionClosed { cause } => Self::ConnectionClosed {
                cause: cause.clone(),
            },
            Self::Cancelled => Self::Cancelled,
            Self::ClassNotFound { class_id } => Self::ClassNotFound {
                class_id: *class_id,
            },
            Self::FieldOutOfRange {
                class_id,
                index,
                count,
            } => Self::FieldOutOfRange {
                class_id: *class_id,
                index: *index,
                count: *count,
            },
            Self::TypeMismatch { expected, actual } => Self::TypeMismatch {
                expected: *expected,
                actual: *actual,
            },
            Self::Config { detail } => Self::Config {
                detail: detail.clone(),
            },
            Self::Io(err) => Self::Io(std::io::Error::new(err.kind(), err.to_string())),
            Self::Internal(msg) => Self::Internal(msg.clone()),
        }
    }
}

/// Result type alias using `FabricError`.
pub type Result<T> = std::result::Result<T, FabricError>;
