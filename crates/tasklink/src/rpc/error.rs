//! Errors surfaced by control-plane calls.
//!
//! Every error is classified where it is created, so the retry loop only
//! checks [`RpcError::class`] instead of inspecting causes.

use std::fmt;
use std::io;

/// How the retry loop treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt.
    Transient,
    Fatal,
    /// The caller gave up; never retried.
    Cancelled,
}

/// Remote status codes, mirroring the gRPC set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// Codes that describe a condition the server may recover from.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Internal | Self::Unavailable | Self::Unknown | Self::Aborted | Self::Cancelled
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<tonic::Code> for StatusCode {
    fn from(code: tonic::Code) -> Self {
        match code {
            tonic::Code::Cancelled => Self::Cancelled,
            // A status carrying `Ok` is not a meaningful failure.
            tonic::Code::Ok | tonic::Code::Unknown => Self::Unknown,
            tonic::Code::InvalidArgument => Self::InvalidArgument,
            tonic::Code::DeadlineExceeded => Self::DeadlineExceeded,
            tonic::Code::NotFound => Self::NotFound,
            tonic::Code::AlreadyExists => Self::AlreadyExists,
            tonic::Code::PermissionDenied => Self::PermissionDenied,
            tonic::Code::ResourceExhausted => Self::ResourceExhausted,
            tonic::Code::FailedPrecondition => Self::FailedPrecondition,
            tonic::Code::Aborted => Self::Aborted,
            tonic::Code::OutOfRange => Self::OutOfRange,
            tonic::Code::Unimplemented => Self::Unimplemented,
            tonic::Code::Internal => Self::Internal,
            tonic::Code::Unavailable => Self::Unavailable,
            tonic::Code::DataLoss => Self::DataLoss,
            tonic::Code::Unauthenticated => Self::Unauthenticated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// Connection-level failure before or during a call.
    #[error("I/O error: {message}")]
    Io { kind: io::ErrorKind, message: String },

    /// The remote side answered with an error status.
    #[error("{code}: {message}")]
    Status { code: StatusCode, message: String },

    /// Several failures reported together by one call.
    #[error("{} errors, first: {}", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    Aggregate(Vec<RpcError>),

    /// Cancelled locally through the caller's token.
    #[error("call cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Retryable failures on every allowed attempt.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<RpcError>,
        /// One entry per failed attempt, oldest first.
        history: Vec<RpcError>,
    },

    #[error("channel pool closed")]
    PoolClosed,
}

impl RpcError {
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io { .. } => ErrorClass::Transient,
            Self::Status { code, .. } if code.is_transient() => ErrorClass::Transient,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Aggregate(errors) => {
                let classes: Vec<_> = errors.iter().map(Self::class).collect();
                if classes.contains(&ErrorClass::Cancelled) {
                    ErrorClass::Cancelled
                } else if classes.contains(&ErrorClass::Transient) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            Self::Status { .. }
            | Self::InvalidArgument(_)
            | Self::Exhausted { .. }
            | Self::PoolClosed => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_cancelled(&self) -> bool {
        self.class() == ErrorClass::Cancelled
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        Self::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        Self::Status {
            code: status.code().into(),
            message: status.message().to_string(),
        }
    }
}
