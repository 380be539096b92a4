//! Error kinds surfaced by the store, and the ones that are absorbed into
//! logging so the background write/index pipelines stay live.
//!
//! Only [`Error::BadId`], [`Error::AlreadyRegistered`] and [`Error::AccessDenied`]
//! are meant to propagate to callers of the public API; the rest (load
//! failures, write failures, index-of-one failures) are logged and
//! swallowed at the point they occur, per the error handling design.

use std::fmt;

pub type CResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// An id was malformed: a string id that parses as a positive integer.
    BadId(String),

    /// A class name was registered twice.
    AlreadyRegistered(String),

    /// Loading an entity's row failed after the single retry.
    LoadFailure(String),

    /// A write batch failed to commit.
    WriteFailure(String),

    /// Indexing a single entry failed; the indexer logs this and moves on.
    IndexOfOne(String),

    /// A permission callback rejected the call.
    AccessDenied(String),

    /// Encoding/decoding of an ordered key failed.
    Codec(String),

    /// JSON (de)serialization failed.
    Parse(String),

    /// The underlying KV engine failed.
    Internal(String),

    /// Propagated I/O failure from the on-disk engine.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadId(id) => write!(f, "bad id: {}", id),
            Error::AlreadyRegistered(name) => write!(f, "class already registered: {}", name),
            Error::LoadFailure(msg) => write!(f, "load failure: {}", msg),
            Error::WriteFailure(msg) => write!(f, "write failure: {}", msg),
            Error::IndexOfOne(msg) => write!(f, "index-of-one failure: {}", msg),
            Error::AccessDenied(msg) => write!(f, "access denied: {}", msg),
            Error::Codec(msg) => write!(f, "codec error: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(Error::BadId("7".into()).to_string(), "bad id: 7");
        assert!(Error::AccessDenied("no".into()).to_string().contains("access denied"));
    }
}
