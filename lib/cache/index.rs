use crate::cache::block::{Block, Owner};
use crate::cache::file::{FileState, FileTable};
use crate::cache::lru::LruList;
use crate::cache::pool::RecyclePool;
use crate::cache::stats::Counters;
use crate::cache::writer::{self, WriteQueue};
use crate::config::CacheConfig;
use crate::utils::BLOCK_ADDRESS_SPACE;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockWriteGuard};
use std::time::Duration;

type BlockMap = BTreeMap<u64, Mutex<Block>>;

enum Hit {
    Missing,
    Stale,
    Merged { full: bool },
}

/// The cache-wide block index.
///
/// Lock order is `map` then `lru` then `used`, file state locks come last.
/// Every resident block is in `map`, only read blocks are in `lru`. `used`
/// counts resident and queued blocks in whole block capacities.
pub struct CacheIndex {
    block_size: u64,
    max_size: u64,
    threshold: u64,
    evict_target: Option<u64>,
    force_timeout: Duration,
    map: RwLock<BlockMap>,
    lru: Mutex<LruList<u64>>,
    used: Mutex<u64>,
    write_done: Condvar,
    pool: RecyclePool,
    queue: WriteQueue,
    files: Arc<FileTable>,
    counters: Counters,
}

impl CacheIndex {
    pub(crate) fn new(cfg: &CacheConfig, files: Arc<FileTable>, queue: WriteQueue) -> Self {
        Self {
            block_size: cfg.block_size,
            max_size: cfg.max_cache_size,
            threshold: cfg.broadcast_threshold(),
            evict_target: cfg.evict_target(),
            force_timeout: cfg.force_write_timeout(),
            map: RwLock::new(BTreeMap::new()),
            lru: Mutex::new(LruList::new()),
            used: Mutex::new(0),
            write_done: Condvar::new(),
            pool: RecyclePool::new(cfg.block_size, cfg.pool_ceiling()),
            queue,
            files,
            counters: Counters::default(),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// bytes of resident and queued blocks
    pub fn used(&self) -> u64 {
        *self.used.lock().unwrap()
    }

    pub fn resident(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn contains(&self, key: u64) -> bool {
        self.map.read().unwrap().contains_key(&key)
    }

    pub(crate) fn pool(&self) -> &RecyclePool {
        &self.pool
    }

    pub(crate) fn files(&self) -> &FileTable {
        &self.files
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    /// copy cached bytes into `buf`, a hit needs one piece covering all of it
    pub fn get_read(&self, key: u64, buf: &mut [u8], off: u64) -> bool {
        let map = self.map.read().unwrap();
        let hit = match map.get(&key) {
            None => false,
            Some(slot) => slot.lock().unwrap().get_piece(buf, off),
        };
        if hit {
            self.lru.lock().unwrap().move_back(&key);
        }
        drop(map);
        self.counters.record_read(hit);
        hit
    }

    /// cache bytes just fetched from the remote file
    pub(crate) fn add_read(&self, key: u64, data: &[u8], off: u64, file: &Arc<FileState>) {
        if data.is_empty() {
            return;
        }
        loop {
            {
                let map = self.map.read().unwrap();
                if let Some(slot) = map.get(&key) {
                    let mut b = slot.lock().unwrap();
                    // dirty bytes are newer than anything fetched
                    if b.is_write() {
                        return;
                    }
                    let added = b.add_piece(data, off);
                    drop(b);
                    file.incr_reads(added);
                    self.lru.lock().unwrap().move_back(&key);
                    self.counters.record_add_read(added);
                    return;
                }
            }
            if file.size_writes() != 0 {
                return;
            }

            let mut b = self.pool.take();
            let owner = Owner {
                file: file.clone(),
                remote: None,
            };
            let added = b.recycle(key % BLOCK_ADDRESS_SPACE, false, owner, off, data);
            match self.insert_new(key, b) {
                Ok(()) => {
                    self.counters.record_add_read(added);
                    return;
                }
                Err(b) => self.pool.give_back(b),
            }
        }
    }

    /// merge written bytes into the dirty block of `key`, a block that
    /// becomes full leaves the index for the write-back queue
    pub(crate) fn add_write(&self, key: u64, data: &[u8], off: u64, owner: &Owner) {
        if data.is_empty() {
            return;
        }
        loop {
            if owner.file.size_reads() != 0 {
                self.drop_reads(&owner.file);
            }

            let hit = {
                let map = self.map.read().unwrap();
                match map.get(&key) {
                    None => Hit::Missing,
                    Some(slot) => {
                        let mut b = slot.lock().unwrap();
                        if b.is_write() {
                            let added = b.add_piece(data, off);
                            owner.file.incr_writes(added, false);
                            self.counters.record_add_write(added);
                            Hit::Merged { full: b.is_full() }
                        } else {
                            Hit::Stale
                        }
                    }
                }
            };

            match hit {
                Hit::Merged { full } => {
                    if full {
                        self.queue_if_full(key);
                    }
                    return;
                }
                Hit::Stale => {
                    self.drop_reads(&owner.file);
                    continue;
                }
                Hit::Missing => {}
            }

            let mut b = self.pool.take();
            let added = b.recycle(key % BLOCK_ADDRESS_SPACE, true, owner.clone(), off, data);
            match self.insert_new(key, b) {
                Ok(()) => {
                    self.counters.record_add_write(added);
                    return;
                }
                Err(b) => self.pool.give_back(b),
            }
        }
    }

    /// queue every resident dirty block of `file`, full or not
    pub fn flush_writes(&self, file: &FileState) {
        let mut map = self.map.write().unwrap();
        let keys: Vec<u64> = map
            .range_mut(file.first_key()..file.last_key())
            .filter_map(|(k, s)| s.get_mut().unwrap().is_write().then_some(*k))
            .collect();
        for k in keys {
            if let Some(slot) = map.remove(&k) {
                self.push_write(slot.into_inner().unwrap());
            }
        }
    }

    /// queue every resident dirty block of every file
    pub fn flush_all(&self) {
        let mut map = self.map.write().unwrap();
        let keys: Vec<u64> = map
            .iter_mut()
            .filter_map(|(k, s)| s.get_mut().unwrap().is_write().then_some(*k))
            .collect();
        let n = keys.len();
        for k in keys {
            if let Some(slot) = map.remove(&k) {
                self.push_write(slot.into_inner().unwrap());
            }
        }
        log::info!("flush all, {} dirty blocks queued", n);
    }

    /// drop every read block of `file`
    pub fn drop_reads(&self, file: &FileState) {
        let mut map = self.map.write().unwrap();
        let mut lru = self.lru.lock().unwrap();
        let keys: Vec<u64> = map
            .range_mut(file.first_key()..file.last_key())
            .filter_map(|(k, s)| (!s.get_mut().unwrap().is_write()).then_some(*k))
            .collect();
        for k in keys {
            if let Some(slot) = map.remove(&k) {
                lru.remove(&k);
                self.discard(slot.into_inner().unwrap());
            }
        }
    }

    /// evict the least recently used read block, false if there is none
    pub fn remove_read_block(&self) -> bool {
        let mut map = self.map.write().unwrap();
        self.evict_one(&mut map)
    }

    pub(crate) fn stop_worker(&self) {
        self.queue.stop();
    }

    /// return freed capacity, wakes blocked writers when the occupancy
    /// crosses below the threshold or a new block fits again
    pub(crate) fn release(&self, n: u64) {
        let mut used = self.used.lock().unwrap();
        let before = *used;
        assert!(before >= n, "cache used {} below released {}", before, n);
        *used -= n;
        let after = *used;
        let crossed = before > self.threshold && after <= self.threshold;
        let room = before + self.block_size >= self.max_size && after + self.block_size < self.max_size;
        if crossed || room {
            self.write_done.notify_all();
        }
    }

    fn push_write(&self, b: Block) {
        if let Err(b) = self.queue.push(b) {
            // no worker left, write it on the caller's thread
            writer::process(self, b);
        }
    }

    fn queue_if_full(&self, key: u64) {
        let mut map = self.map.write().unwrap();
        let full = match map.get_mut(&key) {
            None => false,
            Some(slot) => {
                let b = slot.get_mut().unwrap();
                b.is_write() && b.is_full()
            }
        };
        if full {
            if let Some(slot) = map.remove(&key) {
                self.push_write(slot.into_inner().unwrap());
            }
        }
    }

    /// admit a freshly filled block, making room first. The block is handed
    /// back if another thread inserted `key` in the meantime.
    fn insert_new(&self, key: u64, b: Block) -> Result<(), Block> {
        let mut map = self.map.write().unwrap();
        loop {
            if map.contains_key(&key) {
                return Err(b);
            }
            if self.used() + self.block_size < self.max_size {
                break;
            }
            if self.evict_pass(&mut map) {
                continue;
            }
            map = self.force_write(map);
        }

        *self.used.lock().unwrap() += self.block_size;
        let file = match b.owner() {
            Some(o) => o.file.clone(),
            None => unreachable!("block without owner"),
        };
        if b.is_write() {
            file.incr_writes(b.size_data(), true);
            if b.is_full() {
                self.push_write(b);
            } else {
                map.insert(key, Mutex::new(b));
            }
        } else {
            file.incr_reads(b.size_data());
            map.insert(key, Mutex::new(b));
            self.lru.lock().unwrap().push_back(key);
        }
        Ok(())
    }

    fn evict_pass(&self, map: &mut BlockMap) -> bool {
        if !self.evict_one(map) {
            return false;
        }
        if let Some(target) = self.evict_target {
            while self.used() > target && self.evict_one(map) {}
        }
        true
    }

    fn evict_one(&self, map: &mut BlockMap) -> bool {
        let key = match self.lru.lock().unwrap().pop_front() {
            None => return false,
            Some(k) => k,
        };
        let b = match map.remove(&key) {
            Some(slot) => slot.into_inner().unwrap(),
            None => panic!("lru key {} missing from the index", key),
        };
        assert!(!b.is_write(), "dirty block {} on the lru list", key);
        log::debug!("evict block {} size {}", key, b.size_data());
        let file = b.owner().map(|o| o.file.clone());
        self.discard(b);
        self.counters.record_evict();
        if let Some(f) = file {
            self.files.remove(&f, true);
        }
        true
    }

    fn discard(&self, b: Block) {
        if let Some(o) = b.owner() {
            o.file.decr_reads(b.size_data());
        }
        self.release(b.capacity());
        self.pool.give_back(b);
    }

    /// nothing left to evict: push out the first dirty block found and wait
    /// a little for the worker to free some room
    fn force_write<'a>(&'a self, mut map: RwLockWriteGuard<'a, BlockMap>) -> RwLockWriteGuard<'a, BlockMap> {
        let victim = map
            .iter_mut()
            .find_map(|(k, s)| s.get_mut().unwrap().is_write().then_some(*k));
        if let Some(slot) = victim.and_then(|k| map.remove(&k)) {
            let b = slot.into_inner().unwrap();
            log::debug!("force write block at {} size {}", b.off_start(), b.size_data());
            self.counters.record_force_write();
            self.push_write(b);
        }
        drop(map);

        let used = self.used.lock().unwrap();
        let (bs, max) = (self.block_size, self.max_size);
        let (used, res) = self
            .write_done
            .wait_timeout_while(used, self.force_timeout, |u| *u + bs >= max)
            .unwrap();
        if res.timed_out() {
            log::debug!("no room after {:?}, cache used {}", self.force_timeout, *used);
        }
        drop(used);
        self.map.write().unwrap()
    }
}
