use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::{self, Display, Formatter};

/// Shortcut function for creating a command.
#[must_use]
#[inline(always)]
pub fn cmd(name: &'static str) -> CommandBuilder {
    CommandBuilder::new(name)
}

/// A fully serialized RESP command frame, ready to be written to a
/// connection. Both the ad-hoc [`CommandBuilder`] and the stage-spec
/// template expansion produce this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    buffer: Bytes,
}

impl Command {
    pub(crate) fn from_frame(name: &'static str, buffer: Bytes) -> Self {
        Self { name, buffer }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bytes(&self) -> &Bytes {
        &self.buffer
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Builder for ad-hoc commands (AUTH, ROLE, CLUSTER SLOTS, ASKING).
///
/// The engine's tuple operations never go through here; they are assembled
/// from the per-opcode stage templates instead.
#[derive(Debug)]
pub struct CommandBuilder {
    name: &'static str,
    args: BytesMut,
    arg_count: usize,
}

impl CommandBuilder {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: BytesMut::with_capacity(64),
            arg_count: 0,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        put_bulk(&mut self.args, arg.as_ref());
        self.arg_count += 1;
        self
    }
}

impl From<CommandBuilder> for Command {
    fn from(builder: CommandBuilder) -> Self {
        let mut buffer = BytesMut::with_capacity(builder.name.len() + builder.args.len() + 16);
        put_array_header(&mut buffer, 1 + builder.arg_count);
        put_bulk(&mut buffer, builder.name.as_bytes());
        buffer.put_slice(&builder.args);

        Command {
            name: builder.name,
            buffer: buffer.freeze(),
        }
    }
}

/// Writes `*<n>\r\n`.
#[inline]
pub(crate) fn put_array_header(buffer: &mut BytesMut, len: usize) {
    let mut itoa_buf = itoa::Buffer::new();
    buffer.put_u8(b'*');
    buffer.put_slice(itoa_buf.format(len).as_bytes());
    buffer.put_slice(b"\r\n");
}

/// Writes `$<len>\r\n<arg>\r\n`.
#[inline]
pub(crate) fn put_bulk(buffer: &mut BytesMut, arg: &[u8]) {
    let mut itoa_buf = itoa::Buffer::new();
    buffer.put_u8(b'$');
    buffer.put_slice(itoa_buf.format(arg.len()).as_bytes());
    buffer.put_slice(b"\r\n");
    buffer.put_slice(arg);
    buffer.put_slice(b"\r\n");
}
