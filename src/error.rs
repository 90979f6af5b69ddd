use thiserror::Error;

use crate::engine::Ptr;

#[derive(Debug, Error)]
pub enum SqlBridgeError {
    /// A non-OK status from the engine, carrying the engine's current error message.
    #[error("{0}")]
    EngineError(String),

    #[error("Statement closed")]
    StatementClosed,

    #[error("Database closed")]
    DatabaseClosed,

    #[error("Wrong API use : tried to bind a value of an unknown type ({0}).")]
    UnsupportedBindType(String),

    #[error("Nothing to prepare")]
    NothingToPrepare,

    #[error("out of memory: could not allocate {requested} bytes in linear memory")]
    OutOfMemory { requested: usize },

    #[error("Wrong API use : tried to return a value of an unknown type ({0}).")]
    WrongReturnType(String),

    #[error("linear memory access out of bounds: {len} bytes at address {address}")]
    MemoryAccess { address: Ptr, len: usize },

    #[error("function table exhausted: {0}")]
    TableExhausted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// An error message relayed by the worker.
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Protocol(String),
}

/// Failure reported by a user-defined function.
///
/// The message is handed to the engine verbatim and surfaces as the
/// [`SqlBridgeError::EngineError`] of the statement that called the function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FunctionError {
    message: String,
}

impl FunctionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for FunctionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for FunctionError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<SqlBridgeError> for FunctionError {
    fn from(err: SqlBridgeError) -> Self {
        Self::new(err.to_string())
    }
}
