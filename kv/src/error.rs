use std::io;

/// The crate-wide result alias. Every fallible operation in storage, the
/// write-ahead log, the replica, and the coordinator returns this.
pub type CResult<T> = Result<T, Error>;

/// Errors surfaced by the storage engine, the write-ahead log, and the 2PC
/// state machines built on top of them.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid value: {0}")]
    Value(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("key not found")]
    KeyNotFound,

    #[error("unexpected end of file")]
    Eof,

    #[error("operation interrupted")]
    Interrupted,

    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A transaction id referenced by `Commit`/`Abort` that the replica or
    /// coordinator has never seen (or has already terminalized in memory).
    #[error("unknown transaction: {0}")]
    UnknownTransaction(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}
