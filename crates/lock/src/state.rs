//! On-disk layout of the lock-state shared-memory file: an exclusive
//! slot, a shared-reader count, and an array of partition slots — each
//! slot tracking the holding process's pid and its nesting depth.

const MAGIC: &[u8; 4] = b"MLCK";
pub const HEADER_SIZE: usize = 24;
pub const PARTITION_SLOT_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockSlot {
    pub holder_pid: u32,
    pub depth: u32,
}

impl LockSlot {
    pub fn held(&self) -> bool {
        self.depth > 0
    }

    fn decode(buf: &[u8]) -> Self {
        LockSlot {
            holder_pid: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            depth: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.holder_pid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.depth.to_le_bytes());
        buf[8..12].fill(0);
    }
}

/// A view over the lock-state shared-memory region. Every accessor reads
/// straight from the mapping; callers are expected to hold the
/// corresponding OS-level lock (flock/fcntl) before mutating a slot, so
/// there is no additional synchronization here.
pub struct LockState<'a> {
    buf: &'a mut [u8],
}

impl<'a> LockState<'a> {
    pub fn required_size(partition_count: u32) -> usize {
        HEADER_SIZE + partition_count as usize * PARTITION_SLOT_SIZE
    }

    /// Lay out a freshly created lock-state region.
    pub fn format(buf: &mut [u8], partition_count: u32) {
        buf[..buf.len()].fill(0);
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&partition_count.to_le_bytes());
    }

    pub fn open(buf: &'a mut [u8]) -> Self {
        debug_assert_eq!(&buf[0..4], MAGIC, "lock state magic mismatch");
        LockState { buf }
    }

    pub fn partition_count(&self) -> u32 {
        u32::from_le_bytes(self.buf[4..8].try_into().unwrap())
    }

    pub fn exclusive(&self) -> LockSlot {
        LockSlot::decode(&self.buf[8..20])
    }

    pub fn set_exclusive(&mut self, slot: LockSlot) {
        slot.encode(&mut self.buf[8..20]);
    }

    pub fn shared_reader_count(&self) -> i32 {
        i32::from_le_bytes(self.buf[20..24].try_into().unwrap())
    }

    pub fn set_shared_reader_count(&mut self, count: i32) {
        self.buf[20..24].copy_from_slice(&count.to_le_bytes());
    }

    pub fn partition(&self, index: u32) -> LockSlot {
        let start = HEADER_SIZE + index as usize * PARTITION_SLOT_SIZE;
        LockSlot::decode(&self.buf[start..start + 12])
    }

    pub fn set_partition(&mut self, index: u32, slot: LockSlot) {
        let start = HEADER_SIZE + index as usize * PARTITION_SLOT_SIZE;
        slot.encode(&mut self.buf[start..start + 12]);
    }
}
