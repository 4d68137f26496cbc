use memchr::memchr;

/// Number of hash slots of a Redis cluster.
pub(crate) const SLOT_COUNT: usize = 16384;

/// Sentinel for a slot without an owning connection.
pub(crate) const INVAL: u16 = u16::MAX;

/// Hash slot of a key per the Redis Cluster specification: CRC16 (XMODEM)
/// modulo 16384, applied to the `{...}` hash-tag substring when present.
pub(crate) fn hash_slot(key: &[u8]) -> u16 {
    let hashed = match memchr(b'{', key) {
        Some(open) => match memchr(b'}', &key[open + 1..]) {
            // an empty {} does not select a tag
            Some(close) if close > 0 => &key[open + 1..open + 1 + close],
            _ => key,
        },
        None => key,
    };

    crc16::State::<crc16::XMODEM>::calculate(hashed) % SLOT_COUNT as u16
}

/// Bit vector of the hash slots a single connection serves.
#[derive(Debug)]
pub(crate) struct SlotBitmap {
    bits: [u64; SLOT_COUNT / 64],
}

impl SlotBitmap {
    pub fn new() -> Self {
        Self {
            bits: [0; SLOT_COUNT / 64],
        }
    }

    #[inline]
    pub fn set(&mut self, slot: u16) {
        self.bits[slot as usize / 64] |= 1 << (slot as usize % 64);
    }

    #[inline]
    pub fn unset(&mut self, slot: u16) {
        self.bits[slot as usize / 64] &= !(1 << (slot as usize % 64));
    }

    pub fn set_range(&mut self, first: u16, last: u16) {
        for slot in first..=last {
            self.set(slot);
        }
    }

    pub fn clear(&mut self) {
        self.bits = [0; SLOT_COUNT / 64];
    }

    /// All slots currently set, in ascending order.
    pub fn slots(&self) -> impl Iterator<Item = u16> + '_ {
        self.bits.iter().enumerate().flat_map(|(word, bits)| {
            (0..64)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| (word * 64 + bit) as u16)
        })
    }
}

/// The locator: maps each of the 16384 hash slots to the index of the
/// connection-manager slot serving it, or [`INVAL`].
#[derive(Debug)]
pub(crate) struct SlotMap {
    slots: Vec<u16>,
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            slots: vec![INVAL; SLOT_COUNT],
        }
    }

    #[inline]
    pub fn conn_index(&self, slot: u16) -> Option<usize> {
        match self.slots[slot as usize] {
            INVAL => None,
            index => Some(index as usize),
        }
    }

    #[inline]
    pub fn assign(&mut self, slot: u16, conn_index: usize) {
        self.slots[slot as usize] = conn_index as u16;
    }

    pub fn associate_range(&mut self, first: u16, last: u16, conn_index: usize) {
        for slot in first..=last {
            self.slots[slot as usize] = conn_index as u16;
        }
    }

    /// Drops every association pointing at `conn_index`, leaving those slots
    /// uncovered until recovery reassigns them.
    pub fn clear_conn(&mut self, conn_index: usize) {
        for entry in self.slots.iter_mut() {
            if *entry == conn_index as u16 {
                *entry = INVAL;
            }
        }
    }

    pub fn reassociate(&mut self, old_index: usize, new_index: usize) {
        for entry in self.slots.iter_mut() {
            if *entry == old_index as u16 {
                *entry = new_index as u16;
            }
        }
    }

    pub fn covered(&self) -> bool {
        self.slots.iter().all(|entry| *entry != INVAL)
    }
}
