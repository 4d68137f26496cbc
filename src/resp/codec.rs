use crate::{
    Error, Result,
    resp::{Command, FrameParser, Value},
};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frames a TCP byte stream into decoded RESP [`Value`]s.
///
/// An incomplete frame leaves the buffer untouched and yields `None`, which
/// makes the framed reader wait for more bytes — the rewind-on-incomplete
/// contract of the parser.
#[derive(Debug)]
pub(crate) struct ValueDecoder;

impl Decoder for ValueDecoder {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>> {
        if src.is_empty() {
            return Ok(None);
        }

        // freeze a cheap view so bulk payloads can be sliced zero-copy
        let view: Bytes = src.clone().freeze();
        match FrameParser::new(&view).parse() {
            Ok((value, frame_len)) => {
                let _ = src.split_to(frame_len);
                Ok(Some(value))
            }
            Err(Error::Eof) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Writes pre-serialized command frames. Coalescing happens naturally by
/// `feed`-ing several commands before a single `flush`.
#[derive(Debug)]
pub(crate) struct CommandEncoder;

impl Encoder<&Command> for CommandEncoder {
    type Error = Error;

    fn encode(&mut self, command: &Command, dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(command.bytes());
        Ok(())
    }
}
