use crate::{Error, RedisError, Result};
use bytes::Bytes;
use std::fmt::{self, Debug, Formatter};

/// Sentinel for a malformed or overflowing RESP integer.
///
/// A reply carrying this value does not fail parsing of the surrounding
/// structure; the per-opcode result checks reject it instead.
pub const NAN: i64 = i64::MIN + 1;

/// Owned model of a single RESP reply.
///
/// Bulk payloads are zero-copy slices of the receive buffer.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    /// `+OK\r\n`
    Simple(Bytes),
    /// `-ERR ...\r\n` (including `-MOVED`/`-ASK`, pre-split into the kind)
    Error(RedisError),
    /// `:42\r\n`
    Integer(i64),
    /// `$5\r\nhello\r\n`
    Bulk(Bytes),
    /// `$-1\r\n` / `*-1\r\n`
    Null,
    /// `*2\r\n...`
    Array(Vec<Value>),
}

impl Value {
    pub fn is_ok(&self) -> bool {
        matches!(self, Value::Simple(s) if s.as_ref() == b"OK")
    }

    pub fn as_integer(&self) -> Result<i64> {
        match self {
            Value::Integer(i) => Ok(*i),
            _ => Err(Error::BeGeneral),
        }
    }

    pub fn as_bulk(&self) -> Result<&Bytes> {
        match self {
            Value::Bulk(b) => Ok(b),
            _ => Err(Error::BeGeneral),
        }
    }

    pub fn as_array(&self) -> Result<&[Value]> {
        match self {
            Value::Array(a) => Ok(a),
            _ => Err(Error::BeGeneral),
        }
    }

    /// Bulk or simple string payload as UTF-8, for small textual fields
    /// (cursors, roles, metadata values).
    pub fn as_str(&self) -> Result<&str> {
        let bytes = match self {
            Value::Bulk(b) => b.as_ref(),
            Value::Simple(s) => s.as_ref(),
            _ => return Err(Error::BeGeneral),
        };
        std::str::from_utf8(bytes).map_err(|_| Error::BeGeneral)
    }

    /// Integer carried either as `:n` or as a decimal bulk string, the two
    /// shapes Redis uses for counters inside EXEC and HMGET replies.
    pub fn as_number(&self) -> Result<i64> {
        match self {
            Value::Integer(i) => Ok(*i),
            Value::Bulk(b) => atoi::atoi(b.as_ref()).ok_or(Error::BeGeneral),
            _ => Err(Error::BeGeneral),
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Simple(s) => write!(f, "Simple({})", String::from_utf8_lossy(s)),
            Value::Error(e) => write!(f, "Error({e})"),
            Value::Integer(i) => write!(f, "Integer({i})"),
            Value::Bulk(b) if b.len() <= 64 => {
                write!(f, "Bulk({})", String::from_utf8_lossy(b))
            }
            Value::Bulk(b) => write!(f, "Bulk(<{} bytes>)", b.len()),
            Value::Null => f.write_str("Null"),
            Value::Array(a) => f.debug_list().entries(a.iter()).finish(),
        }
    }
}
