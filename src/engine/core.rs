use crate::{
    Error, Result,
    client::Config,
    engine::{
        Completion, IteratorPool, Opcode, Request, RequestCtx, TAG_INTERNAL, Tag, TagPool,
    },
    network::{
        ClusterInfo, ConnectionManager, MAX_CONNECTIONS, NodeConnection, POLL_INTERVAL, SlotMap,
    },
};
use log::debug;
use std::{
    collections::{HashSet, VecDeque},
    time::{Duration, Instant},
};

/// Bound of the unprocessed-request work queue.
pub(crate) const WORK_QUEUE_DEPTH: usize = 1024;

/// Per-connection command coalescing budget of one sender pass.
pub(crate) const COALESCED_MAX: usize = 16;

/// Frames drained per receiver tick before yielding back to the sender.
pub(crate) const RECV_FRAME_BUDGET: usize = 4096;

/// Entry of a per-connection posted queue: a request awaiting its replies,
/// or an ASKING exchange whose `+OK` is swallowed.
#[derive(Debug)]
pub(crate) enum PostedEntry {
    Request(RequestCtx),
    Ephemeral,
}

/// The cluster client engine: work/retry queues in front of the sender,
/// per-connection posted queues behind it, the slot locator and the
/// topology snapshot. Single-threaded cooperative: the sender and receiver
/// passes run on the caller's task, serialized by the client's lock.
#[derive(Debug)]
pub(crate) struct Engine {
    pub(crate) config: Config,
    pub(crate) conn_mgr: ConnectionManager,
    pub(crate) locator: SlotMap,
    pub(crate) cluster: ClusterInfo,
    /// unprocessed user requests
    pub(crate) work: VecDeque<RequestCtx>,
    /// requests needing another sender pass (stage advance, redirects)
    pub(crate) retry: VecDeque<RequestCtx>,
    /// per connection-index FIFO of requests with replies pending
    pub(crate) posted: Vec<VecDeque<PostedEntry>>,
    pub(crate) cancellations: HashSet<Tag>,
    pub(crate) tags: TagPool,
    pub(crate) iterators: IteratorPool,
}

impl Engine {
    pub async fn init(config: Config) -> Result<Engine> {
        let mut conn_mgr = ConnectionManager::new(config.authfile.clone());
        let initial = NodeConnection::connect(config.server.clone(), &config.authfile).await?;
        conn_mgr.add(initial)?;

        let mut engine = Engine {
            config,
            conn_mgr,
            locator: SlotMap::new(),
            cluster: ClusterInfo::default(),
            work: VecDeque::new(),
            retry: VecDeque::new(),
            posted: (0..MAX_CONNECTIONS).map(|_| VecDeque::new()).collect(),
            cancellations: HashSet::new(),
            tags: TagPool::new(),
            iterators: IteratorPool::new(),
        };
        engine.refresh_topology().await?;
        Ok(engine)
    }

    /// Fetches the topology and links every master, assigning slot ranges
    /// to the locator.
    pub(crate) async fn refresh_topology(&mut self) -> Result<()> {
        self.cluster = self.conn_mgr.fetch_cluster_info(&self.config.server).await;

        let shards = self.cluster.shards.clone();
        for shard in shards {
            let master = shard.master().clone();
            let index = match self.conn_mgr.find_active(&master) {
                Some(index) => index,
                None => self.conn_mgr.newlink(master).await?,
            };
            if let Some(connection) = self.conn_mgr.get_mut(index) {
                connection.slots.set_range(shard.first_slot, shard.last_slot);
            }
            self.locator
                .associate_range(shard.first_slot, shard.last_slot, index);
        }

        debug!("topology ready, locator covered: {}", self.locator.covered());
        Ok(())
    }

    /// Queues a request, returning its tag.
    pub fn post(&mut self, request: Request) -> Result<Tag> {
        if matches!(request.opcode, Opcode::NsAddUnits | Opcode::NsRemoveUnits) {
            return Err(Error::NotImplemented);
        }
        if self.work.len() >= WORK_QUEUE_DEPTH {
            return Err(Error::BePost);
        }

        let tag = self.tags.get_tag()?;
        self.work.push_back(RequestCtx::new(tag, request));
        Ok(tag)
    }

    /// Marks an outstanding request for cancellation. The sender drops it at
    /// acquisition; a request already on the wire completes as `Cancelled`
    /// once its reply arrives.
    pub fn cancel(&mut self, tag: Tag) {
        if self.tags.is_pending(tag) {
            self.cancellations.insert(tag);
        }
    }

    /// Drives the engine until the tag completes or the configured timeout
    /// expires (zero timeout blocks forever).
    pub async fn wait(&mut self, tag: Tag) -> Result<Completion> {
        let deadline =
            (!self.config.timeout.is_zero()).then(|| Instant::now() + self.config.timeout);

        loop {
            if let Some(completion) = self.tags.take(tag) {
                return Ok(completion);
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                self.cancel(tag);
                self.tags.close(tag);
                // one more pass so the cancellation can settle
                self.drive(Duration::ZERO).await;
                return Err(Error::Timeout);
            }

            let budget = deadline
                .map(|d| d.saturating_duration_since(Instant::now()).min(POLL_INTERVAL))
                .unwrap_or(POLL_INTERVAL);
            self.drive(budget).await;
        }
    }

    /// Non-blocking poll: one sender pass, drain whatever replies are
    /// already buffered, and report the tag's completion if it landed.
    pub async fn test(&mut self, tag: Tag) -> Option<Completion> {
        self.send_pass().await;
        self.drain_buffered().await;
        self.tags.take(tag)
    }

    /// One cooperative tick: send everything sendable, then receive for at
    /// most `budget`.
    pub(crate) async fn drive(&mut self, budget: Duration) {
        self.send_pass().await;
        self.receive_pass(budget).await;
    }

    /// Delivers a completion into its tag slot, honoring cancellations of
    /// in-flight requests and discarding internal ones.
    pub(crate) fn deliver(&mut self, mut completion: Completion) {
        if completion.tag == TAG_INTERNAL {
            return;
        }
        if self.cancellations.remove(&completion.tag) {
            completion = Completion::error(completion.tag, Error::Cancelled);
        }
        self.tags.deliver(completion);
    }

    /// Connection indices with replies outstanding.
    pub(crate) fn wanted(&self) -> Vec<bool> {
        self.posted.iter().map(|queue| !queue.is_empty()).collect()
    }

    /// Recovery gave up: everything queued completes as `NoConnect`.
    pub(crate) fn drain_unsendable(&mut self) {
        while let Some(ctx) = self
            .retry
            .pop_front()
            .or_else(|| self.work.pop_front())
        {
            self.deliver(Completion::error(ctx.tag, Error::NoConnect));
        }
    }
}
