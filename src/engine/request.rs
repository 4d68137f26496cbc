use crate::{engine::Opcode, resp::Value};
use bytes::Bytes;
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Identifier of an outstanding request, an index into the tag table.
pub(crate) type Tag = usize;

/// Tag of engine-internal requests (iterator prefetch); their completions
/// are dropped instead of being delivered.
pub(crate) const TAG_INTERNAL: Tag = usize::MAX;

/// Namespace / tuple-name separator of the Redis key layout `NS::name`.
pub(crate) const NAMESPACE_SEPARATOR: &str = "::";

/// Request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flags {
    #[default]
    None,
    /// Do not block on empty tuples: report `Unavailable` immediately.
    Nowait,
}

/// User-level request as handed to the engine.
#[derive(Debug)]
pub(crate) struct Request {
    pub opcode: Opcode,
    pub ns: String,
    pub key: Bytes,
    /// directory / iterator match template
    pub pattern: String,
    /// PUT payload
    pub value: Bytes,
    /// MOVE destination namespace
    pub dst_ns: String,
    /// NSCREATE group list
    pub groups: String,
    /// ITERATOR continuation handle
    pub iterator: Option<usize>,
}

impl Request {
    pub fn new(opcode: Opcode, ns: impl Into<String>) -> Self {
        Self {
            opcode,
            ns: ns.into(),
            key: Bytes::new(),
            pattern: String::new(),
            value: Bytes::new(),
            dst_ns: String::new(),
            groups: String::new(),
            iterator: None,
        }
    }

    /// Fully qualified Redis key `ns::name`.
    pub fn qualified_key(&self) -> Vec<u8> {
        qualify(&self.ns, &self.key)
    }

    /// MOVE destination key `dst_ns::name`.
    pub fn qualified_dst_key(&self) -> Vec<u8> {
        qualify(&self.dst_ns, &self.key)
    }

    /// SCAN match template `ns::pattern`.
    pub fn match_template(&self) -> Vec<u8> {
        let pattern = if self.pattern.is_empty() { "*" } else { &self.pattern };
        qualify(&self.ns, pattern.as_bytes())
    }
}

pub(crate) fn qualify(ns: &str, key: &[u8]) -> Vec<u8> {
    let mut qualified = Vec::with_capacity(ns.len() + NAMESPACE_SEPARATOR.len() + key.len());
    qualified.extend_from_slice(ns.as_bytes());
    qualified.extend_from_slice(NAMESPACE_SEPARATOR.as_bytes());
    qualified.extend_from_slice(key);
    qualified
}

/// Where the sender directs the next command of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routing {
    /// hash the stage key and consult the locator
    Unknown,
    /// pinned to a connection-manager index (redirects, scans, iterators)
    Conn { index: usize, asking: bool },
}

/// Per-opcode scratch state carried across stages.
#[derive(Debug, Default)]
pub(crate) enum Intern {
    #[default]
    None,
    Move {
        /// DUMP payload stashed for the RESTORE stage
        dump: Option<Bytes>,
    },
    Directory {
        /// key names accumulated across connections, prefix stripped
        names: Vec<Bytes>,
        cursor: String,
        /// snapshot of active connection indices to walk
        conns: Vec<usize>,
        conn_pos: usize,
    },
    Detach {
        cursor: String,
        conns: Vec<usize>,
        conn_pos: usize,
        /// fully qualified keys awaiting deletion
        pending_keys: VecDeque<Bytes>,
        /// key currently on the wire, kept for resend on connection loss
        current_key: Option<Bytes>,
    },
    Iterator {
        handle: usize,
    },
}

/// A request in flight: travels work queue -> posted queue -> retry queue
/// until its final stage completes.
#[derive(Debug)]
pub(crate) struct RequestCtx {
    pub tag: Tag,
    pub request: Request,
    pub stage: usize,
    pub routing: Routing,
    /// replies accumulated toward the current stage's `resp_cnt`
    pub replies: SmallVec<[Value; 4]>,
    pub intern: Intern,
}

impl RequestCtx {
    pub fn new(tag: Tag, request: Request) -> Self {
        Self {
            tag,
            request,
            stage: 0,
            routing: Routing::Unknown,
            replies: SmallVec::new(),
            intern: Intern::None,
        }
    }

    /// Resets transient state so the current stage can be resent elsewhere.
    pub fn reset_for_resend(&mut self) {
        self.routing = Routing::Unknown;
        self.replies.clear();
    }
}
