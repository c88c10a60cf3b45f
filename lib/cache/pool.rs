use crate::cache::block::Block;
use std::sync::{Condvar, Mutex};

struct Inner {
    free: Vec<Block>,
    allocated: u64,
}

/// Blocks that are not part of the cache right now. New blocks are
/// allocated until `ceiling` bytes exist, past that `take` waits for one to
/// come back.
pub struct RecyclePool {
    block_size: u64,
    ceiling: u64,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl RecyclePool {
    pub fn new(block_size: u64, ceiling: u64) -> Self {
        Self {
            block_size,
            ceiling,
            inner: Mutex::new(Inner {
                free: Vec::new(),
                allocated: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// a reset block, the caller reinitializes it with [`Block::recycle`]
    pub fn take(&self) -> Block {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(b) = inner.free.pop() {
                return b;
            }
            if inner.allocated < self.ceiling {
                inner.allocated += self.block_size;
                drop(inner);
                return Block::new(self.block_size as usize);
            }
            log::debug!("block pool at ceiling {}, waiting", self.ceiling);
            inner = self.cond.wait(inner).unwrap();
        }
    }

    pub fn give_back(&self, mut b: Block) {
        b.reset();
        let mut inner = self.inner.lock().unwrap();
        inner.free.push(b);
        self.cond.notify_one();
    }

    /// bytes held by all blocks ever allocated
    pub fn allocated(&self) -> u64 {
        self.inner.lock().unwrap().allocated
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }
}
