use crate::{
    Error, Result,
    network::{Address, ClusterInfo, NodeConnection, Recovery, SlotMap},
    resp::{Value, cmd},
};
use futures_util::{FutureExt, future::select_all};
use log::{debug, info, warn};
use rand::Rng;
use std::{task::Poll, time::Duration};

/// Max number of simultaneously tracked Redis connections.
pub(crate) const MAX_CONNECTIONS: usize = 256;

/// Readiness polling interval of the receive side.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Backoff while a promoted replica has not completed its fail-over yet.
const PROMOTION_DELAY: Duration = Duration::from_millis(250);

/// Tracks active and broken connections in two index-stable parallel slot
/// arrays. A connection occupies either the active or the broken slot at its
/// index, never both; the index is what the slot locator points at, so it
/// must survive fail/recover cycles.
#[derive(Debug)]
pub(crate) struct ConnectionManager {
    authfile: String,
    active: Vec<Option<NodeConnection>>,
    broken: Vec<Option<NodeConnection>>,
    connection_count: usize,
}

impl ConnectionManager {
    pub fn new(authfile: impl Into<String>) -> Self {
        Self {
            authfile: authfile.into(),
            active: (0..MAX_CONNECTIONS).map(|_| None).collect(),
            broken: (0..MAX_CONNECTIONS).map(|_| None).collect(),
            connection_count: 0,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut NodeConnection> {
        self.active.get_mut(index)?.as_mut()
    }

    /// Registers a ready connection into the first free slot pair.
    pub fn add(&mut self, connection: NodeConnection) -> Result<usize> {
        if !connection.is_ready() {
            return Err(Error::NoConnect);
        }

        let index = (0..MAX_CONNECTIONS)
            .find(|&i| self.active[i].is_none() && self.broken[i].is_none())
            .ok_or_else(|| Error::Client("connection slots exhausted".to_owned()))?;

        debug!("[{}] Tracking connection at index {index}", connection.tag());
        self.active[index] = Some(connection);
        self.connection_count += 1;
        Ok(index)
    }

    /// Connects to `address` and registers the new link.
    pub async fn newlink(&mut self, address: Address) -> Result<usize> {
        let connection = NodeConnection::connect(address, &self.authfile).await?;
        self.add(connection)
    }

    /// Moves an active connection into the broken slot at the same index and
    /// closes its socket; the address is retained for recovery.
    pub fn fail(&mut self, index: usize) {
        if let Some(mut connection) = self.active[index].take() {
            warn!("[{}] Connection failed", connection.tag());
            connection.unlink();
            self.broken[index] = Some(connection);
            self.connection_count -= 1;
        }
    }

    /// Drops a connection from either slot array.
    pub fn remove(&mut self, index: usize) -> Result<()> {
        if self.active[index].take().is_some() {
            self.connection_count -= 1;
            Ok(())
        } else if self.broken[index].take().is_some() {
            Ok(())
        } else {
            Err(Error::Unavailable)
        }
    }

    pub fn find_active(&self, address: &Address) -> Option<usize> {
        (0..MAX_CONNECTIONS)
            .find(|&i| self.active[i].as_ref().is_some_and(|c| c.address() == address))
    }

    pub fn active_indices(&self) -> Vec<usize> {
        (0..MAX_CONNECTIONS)
            .filter(|&i| self.active[i].is_some())
            .collect()
    }

    /// A random ready connection, spreading admin queries across the
    /// cluster.
    pub fn any_ready(&self) -> Option<usize> {
        let ready: Vec<usize> = (0..MAX_CONNECTIONS)
            .filter(|&i| self.active[i].as_ref().is_some_and(|c| c.is_ready()))
            .collect();
        if ready.is_empty() {
            None
        } else {
            Some(ready[rand::rng().random_range(0..ready.len())])
        }
    }

    /// Retrieves the cluster topology from any ready node; a single-node
    /// topology built from the configured server is the fallback for plain
    /// Redis deployments.
    pub async fn fetch_cluster_info(&mut self, fallback: &Address) -> ClusterInfo {
        if let Some(index) = self.any_ready()
            && let Some(connection) = self.get_mut(index)
        {
            match connection.call(&cmd("CLUSTER").arg("SLOTS").into()).await {
                Ok(reply) => {
                    if let Ok(info) = ClusterInfo::from_slots_reply(&reply) {
                        return info;
                    }
                    debug!("CLUSTER SLOTS unusable; assuming single node");
                }
                Err(e) => debug!("CLUSTER SLOTS failed ({e}); assuming single node"),
            }
        }

        ClusterInfo::single_node(fallback.clone())
    }

    /// Awaits the next decoded reply on any wanted active connection.
    /// `None` on timeout or when nothing is wanted.
    pub async fn read_any(
        &mut self,
        want: &[bool],
        timeout: Duration,
    ) -> Option<(usize, Option<Result<Value>>)> {
        let futures: Vec<_> = self
            .active
            .iter_mut()
            .enumerate()
            .filter(|(i, c)| want.get(*i).copied().unwrap_or(false) && c.is_some())
            .filter_map(|(i, c)| {
                c.as_mut()
                    .map(|c| async move { (i, c.read_frame().await) }.boxed())
            })
            .collect();

        if futures.is_empty() {
            return None;
        }

        match tokio::time::timeout(timeout, select_all(futures)).await {
            Ok(((index, result), _, _)) => Some((index, result)),
            Err(_) => None,
        }
    }

    /// Non-blocking sibling of [`read_any`](Self::read_any): returns the
    /// first already-buffered reply, if any.
    pub fn try_read_any(&mut self, want: &[bool]) -> Option<(usize, Option<Result<Value>>)> {
        for (index, connection) in self.active.iter_mut().enumerate() {
            if !want.get(index).copied().unwrap_or(false) {
                continue;
            }
            if let Some(connection) = connection.as_mut()
                && let Poll::Ready(result) = connection.try_read_frame()
            {
                return Some((index, result));
            }
        }
        None
    }

    /// The recovery state machine, run by the sender whenever the locator
    /// has uncovered slots. For every broken slot: reconnect in place while
    /// the window is open, otherwise fail over to a replica of the same
    /// shard, verifying the promotion with `ROLE`.
    pub async fn recover(
        &mut self,
        locator: &mut SlotMap,
        cluster: &mut ClusterInfo,
        fallback: &Address,
    ) -> Recovery {
        for index in 0..MAX_CONNECTIONS {
            let Some(connection) = self.broken[index].as_mut() else {
                continue;
            };

            // 1. reconnect to the same address while the window is open
            if connection.recoverable() != Recovery::Unrecoverable {
                let authfile = self.authfile.clone();
                match connection.reconnect(&authfile).await {
                    Ok(()) => match connection.is_master().await {
                        Ok(true) => {
                            // same node, still master: reactivate in place
                            let connection = self.broken[index].take().expect("broken slot");
                            for slot in connection.slots.slots() {
                                locator.assign(slot, index);
                            }
                            info!("[{}] Connection recovered", connection.tag());
                            self.active[index] = Some(connection);
                            self.connection_count += 1;
                            continue;
                        }
                        Ok(false) => {
                            // the node came back as a replica of a new master
                            if self.relink_to_new_master(index, locator, cluster, fallback).await
                            {
                                continue;
                            }
                            return Recovery::Recoverable;
                        }
                        Err(e) => {
                            debug!("[{}] ROLE failed after reconnect: {e}", connection.tag());
                            connection.unlink();
                            return Recovery::Recoverable;
                        }
                    },
                    Err(e) => {
                        debug!("[{}] Reconnect failed: {e}", connection.tag());
                        // a rejected AUTH never recovers on its own
                        let hard_failure = matches!(e, Error::NoAuth);
                        if !hard_failure && connection.recoverable() == Recovery::Recoverable {
                            // still within the window; retry on the next tick
                            return Recovery::Recoverable;
                        }
                        // fall through to replica promotion
                    }
                }
            }

            // 2. the master is gone for good: promote a replica
            match self.promote_replica(index, locator, cluster).await {
                Recovery::Recovered => continue,
                verdict => return verdict,
            }
        }

        if locator.covered() {
            Recovery::Recovered
        } else {
            Recovery::Recoverable
        }
    }

    /// A broken node reconnected but reports itself as replica: fetch a
    /// fresh topology, drop the stale link and connect to whoever owns its
    /// slot range now. True on success.
    async fn relink_to_new_master(
        &mut self,
        index: usize,
        locator: &mut SlotMap,
        cluster: &mut ClusterInfo,
        fallback: &Address,
    ) -> bool {
        let stale = self.broken[index].take().expect("broken slot");
        let Some(first_slot) = stale.slots.slots().next() else {
            // no slots were routed here; nothing to restore
            return true;
        };
        let (slots, tag) = (stale.slots.slots().collect::<Vec<_>>(), stale.tag().to_owned());
        drop(stale);

        *cluster = self.fetch_cluster_info(fallback).await;
        let Some(master) = cluster.shard_for_slot(first_slot).map(|s| s.master().clone()) else {
            warn!("[{tag}] No shard covers slot {first_slot} after refresh");
            return false;
        };

        let new_index = match self.find_active(&master) {
            Some(existing) => existing,
            None => match self.newlink(master.clone()).await {
                Ok(new_index) => new_index,
                Err(e) => {
                    warn!("[{tag}] Cannot link new master {master}: {e}");
                    return false;
                }
            },
        };

        let connection = self.get_mut(new_index).expect("fresh link");
        for slot in slots {
            connection.slots.set(slot);
            locator.assign(slot, new_index);
        }
        info!("[{tag}] Slot range reassigned to {master}");
        true
    }

    /// Fail-over to a replica of the shard the broken connection served.
    async fn promote_replica(
        &mut self,
        index: usize,
        locator: &mut SlotMap,
        cluster: &mut ClusterInfo,
    ) -> Recovery {
        let old_address = self.broken[index]
            .as_ref()
            .expect("broken slot")
            .address()
            .clone();

        let Some(shard) = cluster.shard_for_address_mut(&old_address) else {
            warn!("[{old_address}] Not part of the known topology; giving up");
            return Recovery::Unrecoverable;
        };

        if shard.addresses.len() <= 1 {
            // the range had a single server; nothing to promote
            return Recovery::Unrecoverable;
        }

        let (first_slot, last_slot) = (shard.first_slot, shard.last_slot);
        let candidates: Vec<Address> = shard
            .addresses
            .iter()
            .filter(|a| **a != old_address)
            .cloned()
            .collect();

        for candidate in candidates {
            let mut replica = match NodeConnection::connect(candidate.clone(), &self.authfile).await
            {
                Ok(replica) => replica,
                Err(e) => {
                    debug!("[{candidate}] Replica not reachable: {e}");
                    continue;
                }
            };

            // commit: destroy the old connection, take over its slot range
            // and record the replica as the shard's master
            self.broken[index] = None;
            replica.slots.set_range(first_slot, last_slot);
            let new_index = match self.add(replica) {
                Ok(new_index) => new_index,
                Err(e) => {
                    warn!("[{candidate}] Cannot track promoted master: {e}");
                    return Recovery::Unrecoverable;
                }
            };
            locator.associate_range(first_slot, last_slot, new_index);

            if let Some(shard) = cluster.shard_for_slot_mut(first_slot) {
                shard.promote(&candidate);
            }

            // verify: the cluster may not have finished its own fail-over
            // yet
            let verified = match self.get_mut(new_index) {
                Some(connection) => connection.is_master().await,
                None => Err(Error::NoConnect),
            };
            match verified {
                Ok(true) => {
                    info!(
                        "[{candidate}] Promoted to master for slots {first_slot}..={last_slot}"
                    );
                    return Recovery::Recovered;
                }
                Ok(false) => {
                    debug!("[{candidate}] Still replica; fail-over incomplete");
                }
                Err(e) => {
                    debug!("[{candidate}] ROLE failed: {e}");
                }
            }

            // roll back: mark the new connection failed and uncover its
            // range so the next recovery round re-drives the fail-over
            locator.clear_conn(new_index);
            self.fail(new_index);
            tokio::time::sleep(PROMOTION_DELAY).await;
            return Recovery::Recoverable;
        }

        // every replica unreachable; give the fail-over more time
        debug!("[{old_address}] No replica reachable yet");
        tokio::time::sleep(PROMOTION_DELAY).await;
        Recovery::Recoverable
    }
}
