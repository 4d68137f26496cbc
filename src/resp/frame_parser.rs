use crate::{
    Error, RedisError, Result,
    resp::{NAN, Value},
};
use bytes::Bytes;
use memchr::memchr;

pub(crate) const SIMPLE_STRING_TAG: u8 = b'+';
pub(crate) const ERROR_TAG: u8 = b'-';
pub(crate) const INTEGER_TAG: u8 = b':';
pub(crate) const BULK_STRING_TAG: u8 = b'$';
pub(crate) const ARRAY_TAG: u8 = b'*';

/// Incremental RESP2 parser over a receive buffer.
///
/// Contract: [`parse`](Self::parse) either consumes exactly one complete frame
/// and reports its length, or fails with [`Error::Eof`] having consumed
/// nothing. The caller keeps the buffer untouched on `Eof` and retries once
/// more bytes arrived.
pub struct FrameParser<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl<'a> FrameParser<'a> {
    pub fn new(buf: &'a Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn parse(&mut self) -> Result<(Value, usize)> {
        let value = self.parse_value()?;
        Ok((value, self.pos))
    }

    fn parse_value(&mut self) -> Result<Value> {
        if self.pos >= self.buf.len() {
            return Err(Error::Eof);
        }

        let tag = self.buf[self.pos];
        self.pos += 1;

        match tag {
            SIMPLE_STRING_TAG => {
                let line = self.parse_line()?;
                Ok(Value::Simple(self.buf.slice(line)))
            }
            ERROR_TAG => {
                let line = self.parse_line()?;
                let error = std::str::from_utf8(&self.buf[line])
                    .map(RedisError::from)
                    .map_err(|_| Error::BeGeneral)?;
                Ok(Value::Error(error))
            }
            INTEGER_TAG => {
                let line = self.parse_line()?;
                // malformed numerics degrade to the NAN sentinel instead of
                // poisoning the surrounding structure
                Ok(Value::Integer(
                    atoi::atoi(&self.buf[line]).unwrap_or(NAN),
                ))
            }
            BULK_STRING_TAG => {
                let len = self.parse_length()?;
                if len < 0 {
                    return Ok(Value::Null);
                }

                let start = self.pos;
                let need = start + len as usize + 2;
                if self.buf.len() < need {
                    return Err(Error::Eof);
                }
                if &self.buf[need - 2..need] != b"\r\n" {
                    return Err(Error::BeGeneral);
                }
                self.pos = need;
                Ok(Value::Bulk(self.buf.slice(start..need - 2)))
            }
            ARRAY_TAG => {
                let len = self.parse_length()?;
                if len < 0 {
                    return Ok(Value::Null);
                }

                let mut elements = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    elements.push(self.parse_value()?);
                }
                Ok(Value::Array(elements))
            }
            _ => Err(Error::BeGeneral),
        }
    }

    /// Range of the line body starting at the current position, excluding the
    /// CRLF terminator. Advances past the terminator.
    #[inline]
    fn parse_line(&mut self) -> Result<std::ops::Range<usize>> {
        let rem = &self.buf[self.pos..];
        let i = memchr(b'\r', rem).ok_or(Error::Eof)?;
        if i + 1 >= rem.len() {
            return Err(Error::Eof);
        }
        if rem[i + 1] != b'\n' {
            return Err(Error::BeGeneral);
        }

        let start = self.pos;
        self.pos += i + 2;
        Ok(start..start + i)
    }

    /// Bulk-string and array length headers must be well-formed; unlike
    /// `:` integers there is no way to resynchronize after a bad one.
    #[inline]
    fn parse_length(&mut self) -> Result<i64> {
        let line = self.parse_line()?;
        atoi::atoi(&self.buf[line]).ok_or(Error::BeGeneral)
    }
}
