use crate::{Error, Result, engine::Tag};
use bytes::Bytes;

/// Namespace metadata as stored in the Redis hash under the namespace key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NsMeta {
    pub id: String,
    pub refcnt: i64,
    pub groups: String,
    pub flags: i64,
}

/// Payload attached to a completion, depending on the opcode.
#[derive(Debug)]
pub(crate) enum CompletionData {
    None,
    /// GET / READ tuple value
    Value(Bytes),
    /// DIRECTORY listing, prefix-stripped tuple names
    Names(Vec<Bytes>),
    /// NSQUERY metadata
    Meta(NsMeta),
    /// ITERATOR step: the handle and the next key
    IterKey { handle: usize, key: Bytes },
}

/// Final outcome of a request, delivered into its tag slot when the final
/// stage's reply arrives (or the request fails / is cancelled).
#[derive(Debug)]
pub(crate) struct Completion {
    pub tag: Tag,
    /// stage-dependent count on success (inserted count, value length, ...)
    pub result: Result<i64>,
    pub data: CompletionData,
}

impl Completion {
    pub fn ok(tag: Tag, rc: i64) -> Self {
        Self {
            tag,
            result: Ok(rc),
            data: CompletionData::None,
        }
    }

    pub fn ok_with(tag: Tag, rc: i64, data: CompletionData) -> Self {
        Self {
            tag,
            result: Ok(rc),
            data,
        }
    }

    pub fn error(tag: Tag, error: Error) -> Self {
        Self {
            tag,
            result: Err(error),
            data: CompletionData::None,
        }
    }
}
