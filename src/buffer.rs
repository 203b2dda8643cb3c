//! Fixed-size blocks that carry encoded records from producers to a sink.
//!
//! Every block has a [`BlockId`] and a [`BlockState`]. A block is owned by
//! exactly one of the free list, the outgoing queue, or a writer that has
//! drained it (`InFlight`); ownership moves with the [`Buffer`] value.

use std::mem;

pub const BLOCK_SIZE: usize = 16 * 1024;
/// Outgoing queue capacity (1 MiB of blocks).
pub const MAX_BUFFER_COUNT: usize = 1024 * 1024 / BLOCK_SIZE;
/// Free blocks kept around for reuse (256 KiB).
pub const MAX_FREE_COUNT: usize = 256 * 1024 / BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Outgoing,
    InFlight,
    /// Released while the free list was full; the id is recycled.
    Retired,
}

#[derive(Debug)]
pub struct Buffer {
    id: BlockId,
    data: Vec<u8>,
}

impl Buffer {
    fn new(id: BlockId) -> Self {
        Buffer {
            id,
            data: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        BLOCK_SIZE - self.data.len()
    }

    fn reserve(&mut self, size: usize) -> &mut [u8] {
        debug_assert!(size <= self.remaining());
        let start = self.data.len();
        self.data.resize(start + size, 0);
        &mut self.data[start..]
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

#[derive(Debug, Default)]
pub struct BufferPool {
    free: Vec<Buffer>,
    outgoing: Vec<Buffer>,
    states: Vec<BlockState>,
    retired: Vec<BlockId>,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `size` writable bytes at the tail of the outgoing queue,
    /// starting a new block if the current tail lacks room.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds [`BLOCK_SIZE`].
    pub fn reserve(&mut self, size: usize) -> &mut [u8] {
        assert!(size <= BLOCK_SIZE, "reservation of {size} bytes exceeds block size");

        if self
            .outgoing
            .last()
            .map_or(true, |buf| buf.remaining() < size)
        {
            let buf = self.allocate();
            self.outgoing.push(buf);
        }

        let last = self.outgoing.len() - 1;
        self.outgoing[last].reserve(size)
    }

    /// Appends `data` to the outgoing queue, splitting it across blocks.
    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = match self.outgoing.last() {
                Some(buf) if buf.remaining() > 0 => buf.remaining(),
                _ => BLOCK_SIZE,
            };
            let n = room.min(data.len());
            self.reserve(n).copy_from_slice(&data[..n]);
            data = &data[n..];
        }
    }

    fn allocate(&mut self) -> Buffer {
        let buf = if let Some(buf) = self.free.pop() {
            buf
        } else if let Some(id) = self.retired.pop() {
            Buffer::new(id)
        } else {
            let id = BlockId(self.states.len() as u32);
            self.states.push(BlockState::Free);
            Buffer::new(id)
        };
        self.states[buf.id.index()] = BlockState::Outgoing;
        buf
    }

    /// Runs `write` against an empty outgoing queue, then puts the blocks
    /// that were already queued back after whatever `write` produced.
    pub fn write_prefix(&mut self, write: impl FnOnce(&mut Self)) {
        let pending = mem::take(&mut self.outgoing);
        write(self);
        self.outgoing.extend(pending);
    }

    /// Hands every outgoing block to the caller.
    pub fn drain_outgoing(&mut self) -> Vec<Buffer> {
        let bufs = mem::take(&mut self.outgoing);
        for buf in &bufs {
            self.states[buf.id.index()] = BlockState::InFlight;
        }
        bufs
    }

    /// Takes back blocks that have been written out.
    pub fn release(&mut self, bufs: impl IntoIterator<Item = Buffer>) {
        for mut buf in bufs {
            buf.clear();
            if self.free.len() < MAX_FREE_COUNT {
                self.states[buf.id.index()] = BlockState::Free;
                self.free.push(buf);
            } else {
                self.states[buf.id.index()] = BlockState::Retired;
                self.retired.push(buf.id);
            }
        }
    }

    #[must_use]
    pub fn state(&self, id: BlockId) -> Option<BlockState> {
        self.states.get(id.index()).copied()
    }

    #[must_use]
    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn outgoing_bytes(&self) -> usize {
        self.outgoing.iter().map(Buffer::len).sum()
    }
}
