use bytes::Bytes;
use std::collections::VecDeque;

/// Max number of simultaneously active iterators.
pub(crate) const ITERATOR_POOL_SIZE: usize = 10;

/// Keys cached per iterator between SCAN round trips.
pub(crate) const ITERATOR_CACHE_SIZE: usize = 60;

/// Opaque handle of an active key iterator, returned by
/// [`Client::iterate`](crate::client::Client::iterate) and passed back to
/// continue the traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterHandle(pub(crate) usize);

/// One iterator record: the SCAN cursor of the connection currently walked,
/// the snapshot of connections still to visit, and the key cache.
#[derive(Debug, Default)]
pub(crate) struct IterRecord {
    in_use: bool,
    pub ns: String,
    pub cursor: String,
    pub conns: Vec<usize>,
    pub conn_pos: usize,
    pub cache: VecDeque<Bytes>,
    pub remote_complete: bool,
    /// a SCAN for this record is on the wire
    pub scan_in_flight: bool,
}

impl IterRecord {
    fn reset(&mut self) {
        *self = IterRecord::default();
    }

    pub fn current_conn(&self) -> Option<usize> {
        self.conns.get(self.conn_pos).copied()
    }

    /// Advances to the next connection once the current cursor finished;
    /// marks the remote traversal complete after the last one.
    pub fn advance_conn(&mut self) {
        self.conn_pos += 1;
        self.cursor = "0".to_owned();
        if self.conn_pos >= self.conns.len() {
            self.remote_complete = true;
        }
    }

    pub fn pop_key(&mut self) -> Option<Bytes> {
        self.cache.pop_front()
    }

    pub fn needs_refill(&self) -> bool {
        !self.remote_complete && self.cache.len() < ITERATOR_CACHE_SIZE / 2
    }

    pub fn cache_key(&mut self, key: Bytes) {
        if self.cache.len() < ITERATOR_CACHE_SIZE {
            self.cache.push_back(key);
        }
    }

    /// Both the remote traversal and the cache are exhausted.
    pub fn is_complete(&self) -> bool {
        self.remote_complete && self.cache.is_empty()
    }
}

/// Fixed pool of iterator records; a handle is the record index.
#[derive(Debug)]
pub(crate) struct IteratorPool {
    records: Vec<IterRecord>,
}

impl IteratorPool {
    pub fn new() -> Self {
        Self {
            records: (0..ITERATOR_POOL_SIZE).map(|_| IterRecord::default()).collect(),
        }
    }

    /// Claims a free record for a fresh traversal over `conns`.
    pub fn allocate(&mut self, ns: impl Into<String>, conns: Vec<usize>) -> Option<usize> {
        let index = self.records.iter().position(|r| !r.in_use)?;
        let record = &mut self.records[index];
        record.reset();
        record.in_use = true;
        record.ns = ns.into();
        record.cursor = "0".to_owned();
        record.conns = conns;
        Some(index)
    }

    pub fn get_mut(&mut self, handle: usize) -> Option<&mut IterRecord> {
        self.records.get_mut(handle).filter(|r| r.in_use)
    }

    pub fn release(&mut self, handle: usize) {
        if let Some(record) = self.records.get_mut(handle) {
            record.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_allocation_and_exhaustion() {
        let mut pool = IteratorPool::new();
        let handles: Vec<_> = (0..ITERATOR_POOL_SIZE)
            .map(|_| pool.allocate("ns", vec![0]).unwrap())
            .collect();
        assert!(pool.allocate("ns", vec![0]).is_none());

        pool.release(handles[3]);
        assert_eq!(Some(handles[3]), pool.allocate("ns", vec![0]));
    }

    #[test]
    fn record_traversal() {
        let mut pool = IteratorPool::new();
        let handle = pool.allocate("ns", vec![2, 5]).unwrap();
        let record = pool.get_mut(handle).unwrap();

        assert_eq!(Some(2), record.current_conn());
        record.advance_conn();
        assert_eq!(Some(5), record.current_conn());
        assert!(!record.remote_complete);
        record.advance_conn();
        assert!(record.remote_complete);

        record.cache_key(Bytes::from_static(b"k"));
        assert!(!record.is_complete());
        assert_eq!(Some(Bytes::from_static(b"k")), record.pop_key());
        assert!(record.is_complete());
    }
}
