use crate::{
    Error, Result,
    network::{Address, SLOT_COUNT},
    resp::Value,
};
use log::debug;

/// One shard of the cluster: a contiguous slot range and the nodes serving
/// it, master first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerInfo {
    pub first_slot: u16,
    pub last_slot: u16,
    /// master followed by its replicas
    pub addresses: Vec<Address>,
}

impl ServerInfo {
    pub fn master(&self) -> &Address {
        &self.addresses[0]
    }

    pub fn replicas(&self) -> &[Address] {
        &self.addresses[1..]
    }

    /// Moves `address` to the master position after a fail-over.
    pub fn promote(&mut self, address: &Address) {
        if let Some(pos) = self.addresses.iter().position(|a| a == address)
            && pos != 0
        {
            self.addresses.swap(0, pos);
        }
    }
}

/// Snapshot of the cluster topology, replaced atomically on change.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClusterInfo {
    pub shards: Vec<ServerInfo>,
}

impl ClusterInfo {
    /// Single-node pseudo-topology used when `CLUSTER SLOTS` is unsupported
    /// (plain Redis) or unreachable.
    pub fn single_node(address: Address) -> Self {
        Self {
            shards: vec![ServerInfo {
                first_slot: 0,
                last_slot: (SLOT_COUNT - 1) as u16,
                addresses: vec![address],
            }],
        }
    }

    /// Builds the topology from a `CLUSTER SLOTS` reply:
    /// an array of `[first, last, [host, port, ...], ...replicas]` entries.
    pub fn from_slots_reply(reply: &Value) -> Result<Self> {
        let mut shards = Vec::new();

        for shard in reply.as_array()? {
            let fields = shard.as_array()?;
            if fields.len() < 3 {
                return Err(Error::BeGeneral);
            }

            let first_slot = fields[0].as_integer()?;
            let last_slot = fields[1].as_integer()?;
            if !(0..SLOT_COUNT as i64).contains(&first_slot)
                || !(first_slot..SLOT_COUNT as i64).contains(&last_slot)
            {
                return Err(Error::BeGeneral);
            }

            let mut addresses = Vec::with_capacity(fields.len() - 2);
            for node in &fields[2..] {
                let node = node.as_array()?;
                if node.len() < 2 {
                    return Err(Error::BeGeneral);
                }
                let host = node[0].as_str()?.to_owned();
                let port = node[1].as_integer()?;
                let port = u16::try_from(port).map_err(|_| Error::BeGeneral)?;
                addresses.push(Address::new(host, port));
            }

            shards.push(ServerInfo {
                first_slot: first_slot as u16,
                last_slot: last_slot as u16,
                addresses,
            });
        }

        if shards.is_empty() {
            return Err(Error::BeGeneral);
        }

        shards.sort_by_key(|s| s.first_slot);
        debug!("cluster topology: {shards:?}");

        Ok(Self { shards })
    }

    pub fn shard_for_slot(&self, slot: u16) -> Option<&ServerInfo> {
        self.shards
            .iter()
            .find(|s| s.first_slot <= slot && slot <= s.last_slot)
    }

    pub fn shard_for_slot_mut(&mut self, slot: u16) -> Option<&mut ServerInfo> {
        self.shards
            .iter_mut()
            .find(|s| s.first_slot <= slot && slot <= s.last_slot)
    }

    /// Shard whose node list contains `address` (master or replica).
    pub fn shard_for_address_mut(&mut self, address: &Address) -> Option<&mut ServerInfo> {
        self.shards
            .iter_mut()
            .find(|s| s.addresses.iter().any(|a| a == address))
    }
}
