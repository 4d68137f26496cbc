/*!
The cluster client engine: the multi-stage request state machine, the
pipelined sender and receiver passes, tag allocation, completions and the
key iterator pool. Single-threaded cooperative; driven by the public client
under its big lock.
*/

mod completion;
mod core;
mod iterator;
mod opcode;
mod receiver;
mod request;
mod sender;
pub(crate) mod stage;
mod tags;

pub(crate) use completion::*;
pub(crate) use self::core::*;
pub(crate) use iterator::*;
pub(crate) use opcode::*;
pub(crate) use request::*;
pub(crate) use tags::*;

pub use completion::NsMeta;
pub use iterator::IterHandle;
pub use request::Flags;
