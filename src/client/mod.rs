/*!
The public tuple-space client: namespace lifecycle, tuple operations and
the tag-based asynchronous surface, all funneled through the engine under
a coarse lock.
*/

#[allow(clippy::module_inception)]
mod client;
mod config;
mod namespace;

pub use client::*;
pub use config::*;
pub use namespace::NsHandle;
pub(crate) use namespace::*;
