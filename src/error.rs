use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// All error kinds surfaced by the library.
#[derive(Debug, Error)]
pub enum Error {
    /// Internal marker: the receive buffer does not yet hold a complete frame.
    /// Never surfaced to callers; the receiver keeps reading until a full
    /// frame is available.
    #[error("incomplete RESP frame")]
    Eof,
    /// Raised if an error occurs within the driver
    #[error("client error: {0}")]
    Client(String),
    /// Raised if an error occurs while building the [`Config`](crate::client::Config)
    #[error("config error: {0}")]
    Config(String),
    /// Error returned by the Redis server
    #[error("redis error: {0}")]
    Redis(RedisError),
    /// IO error while talking to the Redis server
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A blocking operation exceeded the configured timeout
    #[error("operation timed out")]
    Timeout,
    /// The caller-provided buffer cannot hold the result
    #[error("result exceeds the provided buffer")]
    Ubuffer,
    /// The requested tuple or namespace holds no data
    #[error("tuple or namespace unavailable")]
    Unavailable,
    /// Namespace already exists
    #[error("namespace already exists")]
    Exists,
    /// Namespace is still attached elsewhere
    #[error("namespace busy")]
    NsBusy,
    /// The namespace does not exist (or is marked for deletion)
    #[error("invalid namespace")]
    NsInvalid,
    /// Stale or corrupted namespace handle
    #[error("stale namespace handle")]
    Handle,
    /// Argument validation failed before any backend interaction
    #[error("invalid argument")]
    Invalid,
    /// No request tag available (too many outstanding requests)
    #[error("tag table exhausted")]
    TagError,
    /// AUTH handshake failed
    #[error("authorization failed")]
    NoAuth,
    /// No connection to the responsible server and recovery gave up
    #[error("no connection to server")]
    NoConnect,
    /// The request was cancelled before completion
    #[error("request cancelled")]
    Cancelled,
    /// Operation not implemented by this backend
    #[error("not implemented")]
    NotImplemented,
    /// Operation not valid in the current state
    #[error("invalid operation")]
    InvalidOp,
    /// The engine refused to accept the request
    #[error("posting request failed")]
    BePost,
    /// Unexpected backend reply or protocol violation
    #[error("backend failure")]
    BeGeneral,
}

impl Error {
    /// True for completion states the caller may treat as "no data right now",
    /// as opposed to hard failures.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Unavailable | Error::Timeout)
    }
}

/// Redis server error kind.
///
/// Only the kinds the engine reacts to are split out; everything else is
/// carried verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisErrorKind {
    /// `-ASK <slot> <host>:<port>` temporary redirect
    Ask { hash_slot: u16, address: (String, u16) },
    /// `-MOVED <slot> <host>:<port>` permanent relocation
    Moved { hash_slot: u16, address: (String, u16) },
    NoAuth,
    WrongPass,
    ClusterDown,
    Err,
    Other(String),
}

impl From<&str> for RedisErrorKind {
    fn from(str: &str) -> Self {
        match str {
            "NOAUTH" => Self::NoAuth,
            "WRONGPASS" => Self::WrongPass,
            "CLUSTERDOWN" => Self::ClusterDown,
            "ERR" => Self::Err,
            _ => {
                let mut iter = str.split_whitespace();
                match (iter.next(), iter.next(), iter.next(), iter.next()) {
                    (Some(verb @ ("ASK" | "MOVED")), Some(hash_slot), Some(address), None) => {
                        let parsed = hash_slot.parse::<u16>().ok().zip(
                            address
                                .split_once(':')
                                .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h, p))),
                        );

                        match parsed {
                            Some((hash_slot, (host, port))) if verb == "ASK" => Self::Ask {
                                hash_slot,
                                address: (host.to_owned(), port),
                            },
                            Some((hash_slot, (host, port))) => Self::Moved {
                                hash_slot,
                                address: (host.to_owned(), port),
                            },
                            None => Self::Other(str.to_owned()),
                        }
                    }
                    _ => Self::Other(str.to_owned()),
                }
            }
        }
    }
}

impl Display for RedisErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RedisErrorKind::Ask {
                hash_slot,
                address: (host, port),
            } => f.write_fmt(format_args!("ASK {hash_slot} {host}:{port}")),
            RedisErrorKind::Moved {
                hash_slot,
                address: (host, port),
            } => f.write_fmt(format_args!("MOVED {hash_slot} {host}:{port}")),
            RedisErrorKind::NoAuth => f.write_str("NOAUTH"),
            RedisErrorKind::WrongPass => f.write_str("WRONGPASS"),
            RedisErrorKind::ClusterDown => f.write_str("CLUSTERDOWN"),
            RedisErrorKind::Err => f.write_str("ERR"),
            RedisErrorKind::Other(e) => f.write_str(e),
        }
    }
}

/// Error issued by the Redis server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisError {
    pub kind: RedisErrorKind,
    pub description: String,
}

impl RedisError {
    pub fn is_redirect(&self) -> bool {
        matches!(
            self.kind,
            RedisErrorKind::Ask { .. } | RedisErrorKind::Moved { .. }
        )
    }
}

impl From<&str> for RedisError {
    fn from(error: &str) -> Self {
        match error.split_once(' ') {
            Some(("ASK" | "MOVED", _)) => Self {
                kind: error.into(),
                description: String::new(),
            },
            Some((kind, description)) => Self {
                kind: kind.into(),
                description: description.to_owned(),
            },
            None => Self {
                kind: error.into(),
                description: String::new(),
            },
        }
    }
}

impl Display for RedisError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{} {}", self.kind, self.description))
    }
}
