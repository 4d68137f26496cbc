/*!
RESP is the [Redis Serialization Protocol](https://redis.io/docs/reference/protocol-spec/).

This module holds the owned reply model ([`Value`]), the incremental frame
parser with its consume-exactly-one-frame contract, and command frame
assembly for the few ad-hoc commands the engine issues outside the
stage-spec tables.
*/

mod codec;
mod command;
mod frame_parser;
mod value;

pub(crate) use codec::*;
pub use command::*;
pub use frame_parser::FrameParser;
pub use value::*;
