use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// error type for storage, scheduling and execution operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid instance name: {0}")]
    InvalidInstanceName(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("blob is {0} bytes longer than expected")]
    BlobTooLong(u64),

    #[error("blob is {0} bytes shorter than expected")]
    BlobTooShort(u64),

    #[error("blob checksum mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("too many pending jobs: queue capacity of {0} reached")]
    QueueFull(usize),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("operation not found: {0}")]
    OperationNotFound(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("execution exceeded its deadline of {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stream error: {0}")]
    Stream(#[source] std::io::Error),

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// status code an RPC adapter should report for this error
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidDigest(_)
            | Error::InvalidInstanceName(_)
            | Error::InvalidPath(_)
            | Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::BlobTooLong(_) | Error::BlobTooShort(_) | Error::HashMismatch { .. } => {
                Code::DataLoss
            }
            Error::QueueFull(_) => Code::ResourceExhausted,
            Error::BlobNotFound(_) | Error::OperationNotFound(_) => Code::NotFound,
            Error::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Error::Cancelled => Code::Cancelled,
            Error::Unavailable(_) => Code::Unavailable,
            Error::Execution(_)
            | Error::Internal(_)
            | Error::Io { .. }
            | Error::Stream(_)
            | Error::CborEncode(_)
            | Error::CborDecode(_)
            | Error::Config(_)
            | Error::ConfigSerialize(_) => Code::Internal,
        }
    }

    /// true for cache misses and unknown operation names
    pub fn is_not_found(&self) -> bool {
        self.code() == Code::NotFound
    }

    /// recover a typed error that travelled through a byte stream
    ///
    /// integrity failures raised inside `Read` implementations are wrapped in
    /// `std::io::Error`; this unwraps them again so callers can match on them.
    pub fn from_stream(err: std::io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Error::Stream(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(typed)) => *typed,
            _ => Error::Internal("stream error lost its payload".to_string()),
        }
    }

    /// wrap this error so it can be returned from a `Read` implementation
    pub fn into_stream(self) -> std::io::Error {
        let kind = match self.code() {
            Code::NotFound => std::io::ErrorKind::NotFound,
            Code::InvalidArgument => std::io::ErrorKind::InvalidInput,
            _ => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, self)
    }
}

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

/// canonical status codes, mirroring the ones used by the remote execution RPCs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Ok,
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    ResourceExhausted,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
        };
        f.write_str(name)
    }
}

/// cloneable error snapshot carried inside operations and execute responses
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
