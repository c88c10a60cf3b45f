mod block;
mod file;
mod index;
mod lru;
mod pool;
mod stats;
mod writer;

pub use block::{Block, Owner};
pub use file::{FileRef, FileState, FileTable, WriteError};
pub use index::CacheIndex;
pub use lru::LruList;
pub use pool::RecyclePool;
pub use stats::CacheStats;

use crate::config::CacheConfig;
use crate::store::{Errno, RemoteFile};
use crate::utils::{align_down, BLOCK_ADDRESS_SPACE};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use writer::WriteQueue;

/// Splits `[off, off + len)` at block boundaries, yields the file offset of
/// each part and its range in the caller's buffer.
struct Chunks {
    block_size: u64,
    off: u64,
    pos: usize,
    len: usize,
}

impl Iterator for Chunks {
    type Item = (u64, Range<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.len {
            return None;
        }
        let room = self.block_size - self.off % self.block_size;
        let n = std::cmp::min(self.len - self.pos, room as usize);
        let item = (self.off, self.pos..self.pos + n);
        self.off += n as u64;
        self.pos += n;
        Some(item)
    }
}

/// The block cache a filesystem layer talks to.
///
/// It hands out small file ids, turns `(file, offset)` into block keys and
/// forwards reads, writes and flushes to the [`CacheIndex`]. One write-back
/// worker thread lives as long as the cache.
pub struct BlockCache {
    cfg: CacheConfig,
    index: Arc<CacheIndex>,
    files: Arc<FileTable>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BlockCache {
    pub fn new(cfg: CacheConfig) -> Result<Self, String> {
        cfg.validate()?;
        let files = Arc::new(FileTable::new(cfg.max_files));
        let (queue, rx) = WriteQueue::new();
        let index = Arc::new(CacheIndex::new(&cfg, files.clone(), queue));
        let worker = writer::spawn(index.clone(), rx).map_err(|e| format!("can't start write back worker: {}", e))?;
        log::info!(
            "block cache size {} block {} max files {}",
            cfg.max_cache_size,
            cfg.block_size,
            cfg.max_files
        );
        Ok(Self {
            cfg,
            index,
            files,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    pub fn block_key(&self, id: u64, off: u64) -> u64 {
        id * BLOCK_ADDRESS_SPACE + align_down(off, self.cfg.block_size)
    }

    fn check_range(off: u64, len: usize) -> Result<(), Errno> {
        match off.checked_add(len as u64) {
            Some(end) if end <= BLOCK_ADDRESS_SPACE => Ok(()),
            _ => Err(libc::EFBIG),
        }
    }

    fn chunks(&self, off: u64, len: usize) -> Chunks {
        Chunks {
            block_size: self.cfg.block_size,
            off,
            pos: 0,
            len,
        }
    }

    /// look up the state of `inode`, creating it when asked. When every id
    /// is taken read blocks are evicted until an idle file gives one back,
    /// `None` if that never happens.
    pub fn get_file(&self, inode: u64, create: bool) -> Option<FileRef> {
        if !create {
            return self.files.lookup(inode);
        }
        loop {
            if let Some(f) = self.files.get_or_create(inode) {
                return Some(f);
            }
            if !self.index.remove_read_block() {
                log::warn!("no file id left for inode {}, {} files open", inode, self.files.len());
                return None;
            }
        }
    }

    /// cache `data` as dirty bytes at `off`, the caller returns as soon as
    /// they are merged into blocks
    pub fn submit_write(&self, remote: &Arc<dyn RemoteFile>, inode: u64, data: &[u8], off: u64) -> Result<(), Errno> {
        Self::check_range(off, data.len())?;
        let file = self.get_file(inode, true).ok_or(libc::ENFILE)?;
        let owner = Owner {
            file: file.file().clone(),
            remote: Some(remote.clone()),
        };
        for (cur, r) in self.chunks(off, data.len()) {
            let key = self.block_key(file.id(), cur);
            self.index.add_write(key, &data[r], cur, &owner);
        }
        Ok(())
    }

    /// copy cached bytes at `off` into `buf`, returns how many leading bytes
    /// were served. The count stops at the first block that misses.
    pub fn fetch_read(&self, file: &FileState, buf: &mut [u8], off: u64) -> usize {
        let mut n = 0;
        for (cur, r) in self.chunks(off, buf.len()) {
            let key = self.block_key(file.id(), cur);
            if !self.index.get_read(key, &mut buf[r.clone()], cur) {
                break;
            }
            n += r.len();
        }
        n
    }

    pub fn store_read(&self, file: &FileRef, data: &[u8], off: u64) {
        for (cur, r) in self.chunks(off, data.len()) {
            let key = self.block_key(file.id(), cur);
            self.index.add_read(key, &data[r], cur, file.file());
        }
    }

    /// push out every dirty block of `file` and wait until the worker wrote
    /// them, blocks dirtied meanwhile are pushed out too
    pub fn wait_finish_writes(&self, file: &FileState) {
        let slice = self.cfg.force_write_timeout();
        while file.size_writes() != 0 {
            self.index.flush_writes(file);
            if !file.wait_writes_done_for(slice) {
                log::debug!("inode {} still has {} dirty bytes", file.inode(), file.size_writes());
            }
        }
    }

    pub fn wait_finish_writes_inode(&self, inode: u64) {
        if let Some(f) = self.files.lookup(inode) {
            self.wait_finish_writes(&f);
        }
    }

    /// drop the state of an idle `inode` and recycle its id. A weak removal
    /// tolerates the caller's own reference.
    pub fn remove_file_inode(&self, inode: u64, strong: bool) -> bool {
        self.files.remove_inode(inode, strong)
    }

    /// read `buf.len()` bytes at `off`, from the cache where possible and
    /// from `remote` for the rest, fetched bytes are cached. Returns the
    /// byte count, short only at end of file.
    pub fn read_through(
        &self,
        remote: &Arc<dyn RemoteFile>,
        inode: u64,
        buf: &mut [u8],
        off: u64,
    ) -> Result<usize, Errno> {
        Self::check_range(off, buf.len())?;
        if !self.cfg.cache_read {
            self.wait_finish_writes_inode(inode);
            return remote.read_at(off, buf);
        }
        let file = match self.get_file(inode, true) {
            Some(f) => f,
            None => return remote.read_at(off, buf),
        };
        self.wait_finish_writes(&file);

        let n = self.fetch_read(&file, buf, off);
        if n == buf.len() {
            return Ok(n);
        }
        let m = remote.read_at(off + n as u64, &mut buf[n..])?;
        self.store_read(&file, &buf[n..n + m], off + n as u64);
        Ok(n + m)
    }

    /// write `data` at `off`, through the cache when write caching is on
    pub fn write(&self, remote: &Arc<dyn RemoteFile>, inode: u64, data: &[u8], off: u64) -> Result<usize, Errno> {
        Self::check_range(off, data.len())?;
        if self.cfg.cache_write {
            match self.submit_write(remote, inode, data, off) {
                Ok(()) => return Ok(data.len()),
                Err(libc::ENFILE) => log::warn!("inode {} write at {} bypasses the cache", inode, off),
                Err(e) => return Err(e),
            }
        }
        if let Some(f) = self.files.lookup(inode) {
            self.wait_finish_writes(&f);
            self.index.drop_reads(&f);
        }
        remote.write_at(off, data)?;
        Ok(data.len())
    }

    /// wait for the dirty bytes of `inode`, then report the oldest failed
    /// write back since the last flush
    pub fn flush(&self, inode: u64) -> Result<(), Errno> {
        let file = match self.files.lookup(inode) {
            None => return Ok(()),
            Some(f) => f,
        };
        self.wait_finish_writes(&file);
        match file.take_error() {
            None => Ok(()),
            Some(e) => {
                log::warn!("inode {} flush: {}", inode, e);
                Err(e.errno)
            }
        }
    }

    pub fn fsync(&self, remote: &Arc<dyn RemoteFile>, inode: u64) -> Result<(), Errno> {
        self.flush(inode)?;
        remote.sync()
    }

    pub fn truncate(&self, remote: &Arc<dyn RemoteFile>, inode: u64, len: u64) -> Result<(), Errno> {
        if let Some(f) = self.files.lookup(inode) {
            self.wait_finish_writes(&f);
            self.index.drop_reads(&f);
        }
        remote.truncate(len)
    }

    /// last close of `inode`, the remote handle is closed even when a write
    /// back failed, the first error wins
    pub fn close(&self, remote: &Arc<dyn RemoteFile>, inode: u64) -> Result<(), Errno> {
        let r = match self.files.lookup(inode) {
            None => Ok(()),
            Some(f) => {
                self.wait_finish_writes(&f);
                let r = match f.take_error() {
                    None => Ok(()),
                    Some(e) => Err(e.errno),
                };
                self.files.remove(&f, false);
                r
            }
        };
        let c = remote.close();
        r.and(c)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cache_used: self.index.used(),
            pool_allocated: self.index.pool().allocated(),
            open_files: self.files.len() as u64,
            ..self.index.counters().snapshot()
        }
    }

    /// write back every dirty block and stop the worker, later writes are
    /// written on the caller's thread
    pub fn shutdown(&self) {
        let worker = match self.worker.lock().unwrap().take() {
            None => return,
            Some(w) => w,
        };
        self.index.flush_all();
        self.index.stop_worker();
        if worker.join().is_err() {
            log::error!("write back worker panicked");
        }
        log::info!("block cache shutdown, {:?}", self.stats());
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::BlockCache;
    use crate::config::CacheConfig;
    use crate::store::{MemFile, RemoteFile};
    use crate::utils::BLOCK_ADDRESS_SPACE;
    use std::sync::Arc;

    fn remote(mem: &Arc<MemFile>) -> Arc<dyn RemoteFile> {
        mem.clone()
    }

    fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_chunks() {
        let cache = BlockCache::new(CacheConfig::with_blocks(8, 4)).unwrap();
        let parts: Vec<_> = cache.chunks(5, 19).collect();
        assert_eq!(parts, vec![(5, 0..3), (8, 3..11), (16, 11..19)]);
        assert_eq!(cache.block_key(2, 13), 2 * BLOCK_ADDRESS_SPACE + 8);
        assert_eq!(cache.chunks(8, 0).count(), 0);
    }

    #[test]
    fn test_write_spans_blocks() {
        let cache = BlockCache::new(CacheConfig::with_blocks(8, 8)).unwrap();
        let mem = Arc::new(MemFile::new());
        let r = remote(&mem);
        let data = pattern(1, 19);
        assert_eq!(cache.write(&r, 1, &data, 5), Ok(19));
        cache.flush(1).unwrap();
        assert_eq!(&mem.contents()[5..24], &data[..]);
        assert_eq!(cache.stats().blocks_written, 3);
        assert_eq!(cache.stats().cache_used, 0);
    }

    #[test]
    fn test_read_through() {
        let cache = BlockCache::new(CacheConfig::with_blocks(8, 8)).unwrap();
        let mem = Arc::new(MemFile::new());
        let r = remote(&mem);
        let data = pattern(0, 32);
        mem.write_at(0, &data).unwrap();

        let mut buf = vec![0u8; 20];
        assert_eq!(cache.read_through(&r, 1, &mut buf, 2), Ok(20));
        assert_eq!(buf, &data[2..22]);
        let s = cache.stats();
        assert_eq!((s.read_hits, s.read_misses), (0, 1));

        let mut buf = vec![0u8; 20];
        assert_eq!(cache.read_through(&r, 1, &mut buf, 2), Ok(20));
        assert_eq!(buf, &data[2..22]);
        assert_eq!(cache.stats().read_hits, 3);

        // short read at the end of the file
        let mut buf = vec![0u8; 10];
        assert_eq!(cache.read_through(&r, 1, &mut buf, 30), Ok(2));
        assert_eq!(&buf[..2], &data[30..]);
    }

    #[test]
    fn test_read_after_write() {
        let cache = BlockCache::new(CacheConfig::with_blocks(8, 8)).unwrap();
        let mem = Arc::new(MemFile::new());
        let r = remote(&mem);
        mem.write_at(0, &[b'a'; 16]).unwrap();

        let mut buf = [0u8; 16];
        cache.read_through(&r, 1, &mut buf, 0).unwrap();
        assert_eq!(buf, [b'a'; 16]);

        cache.write(&r, 1, b"bbbb", 6).unwrap();
        let f = cache.get_file(1, false).unwrap();
        assert_eq!(f.size_reads(), 0);
        drop(f);

        cache.read_through(&r, 1, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"aaaaaabbbbaaaaaa");
    }

    #[test]
    fn test_flush_reports_error_once() {
        let cache = BlockCache::new(CacheConfig::with_blocks(8, 8)).unwrap();
        let mem = Arc::new(MemFile::new());
        let r = remote(&mem);
        mem.fail_writes(true);
        cache.write(&r, 1, b"abc", 0).unwrap();
        assert_eq!(cache.flush(1), Err(libc::EIO));
        assert_eq!(cache.flush(1), Ok(()));
        assert_eq!(cache.stats().write_errors, 1);

        cache.write(&r, 1, b"abc", 0).unwrap();
        assert_eq!(cache.fsync(&r, 1), Err(libc::EIO));
        assert_eq!(cache.flush(2), Ok(()));
    }

    #[test]
    fn test_close_releases_file() {
        let cache = BlockCache::new(CacheConfig::with_blocks(8, 8)).unwrap();
        let mem = Arc::new(MemFile::new());
        let r = remote(&mem);
        cache.write(&r, 3, b"hello", 0).unwrap();
        assert_eq!(cache.stats().open_files, 1);
        cache.close(&r, 3).unwrap();
        assert_eq!(mem.contents(), b"hello".to_vec());
        assert_eq!(cache.stats().open_files, 0);
        assert!(cache.get_file(3, false).is_none());
    }

    #[test]
    fn test_remove_file_inode() {
        let cache = BlockCache::new(CacheConfig::with_blocks(8, 8)).unwrap();
        let f = cache.get_file(5, true).unwrap();
        assert!(!cache.remove_file_inode(5, true));
        assert!(cache.remove_file_inode(5, false));
        assert!(!cache.remove_file_inode(5, false));
        drop(f);
        assert!(cache.get_file(5, false).is_none());
    }

    #[test]
    fn test_evict_for_file_id() {
        let mut cfg = CacheConfig::with_blocks(8, 8);
        cfg.max_files = 2;
        let cache = BlockCache::new(cfg).unwrap();
        let mem = Arc::new(MemFile::new());
        let r = remote(&mem);
        mem.write_at(0, &pattern(7, 8)).unwrap();

        let mut buf = [0u8; 8];
        for inode in 1..=3 {
            assert_eq!(cache.read_through(&r, inode, &mut buf, 0), Ok(8));
        }
        // inode 1 lost its block and its id to inode 3
        assert!(cache.get_file(1, false).is_none());
        assert_eq!(cache.stats().open_files, 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_file_ids_exhausted() {
        let mut cfg = CacheConfig::with_blocks(8, 8);
        cfg.max_files = 2;
        let cache = BlockCache::new(cfg).unwrap();
        let mem = Arc::new(MemFile::new());
        let r = remote(&mem);

        let _a = cache.get_file(10, true).unwrap();
        let _b = cache.get_file(11, true).unwrap();
        assert!(cache.get_file(12, true).is_none());
        assert_eq!(cache.submit_write(&r, 12, b"x", 0), Err(libc::ENFILE));

        // falls back to a direct write
        assert_eq!(cache.write(&r, 12, b"x", 0), Ok(1));
        assert_eq!(mem.contents(), b"x".to_vec());
    }

    #[test]
    fn test_truncate_drops_reads() {
        let cache = BlockCache::new(CacheConfig::with_blocks(8, 8)).unwrap();
        let mem = Arc::new(MemFile::new());
        let r = remote(&mem);
        mem.write_at(0, &pattern(0, 8)).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(cache.read_through(&r, 1, &mut buf, 0), Ok(8));
        cache.truncate(&r, 1, 4).unwrap();
        assert_eq!(cache.read_through(&r, 1, &mut buf, 0), Ok(4));
        assert_eq!(&buf[..4], &pattern(0, 4)[..]);
    }

    #[test]
    fn test_out_of_range() {
        let cache = BlockCache::new(CacheConfig::with_blocks(8, 8)).unwrap();
        let mem = Arc::new(MemFile::new());
        let r = remote(&mem);
        assert_eq!(cache.write(&r, 1, b"ab", BLOCK_ADDRESS_SPACE - 1), Err(libc::EFBIG));
        let mut buf = [0u8; 2];
        assert_eq!(cache.read_through(&r, 1, &mut buf, u64::MAX), Err(libc::EFBIG));
        assert!(cache.get_file(1, false).is_none());
    }

    #[test]
    fn test_write_cache_disabled() {
        let mut cfg = CacheConfig::with_blocks(8, 8);
        cfg.cache_write = false;
        let cache = BlockCache::new(cfg).unwrap();
        let mem = Arc::new(MemFile::new());
        let r = remote(&mem);
        cache.write(&r, 1, b"direct", 2).unwrap();
        assert_eq!(mem.writes(), 1);
        assert_eq!(&mem.contents()[2..], b"direct");
        assert_eq!(cache.stats().write_bytes_cached, 0);
    }

    #[test]
    fn test_shutdown_flushes() {
        let cache = BlockCache::new(CacheConfig::with_blocks(8, 8)).unwrap();
        let mem = Arc::new(MemFile::new());
        let r = remote(&mem);
        cache.write(&r, 1, b"abc", 0).unwrap();
        cache.write(&r, 2, b"xyz", 20).unwrap();
        cache.shutdown();
        let data = mem.contents();
        assert_eq!(&data[0..3], b"abc");
        assert_eq!(&data[20..23], b"xyz");
        assert_eq!(cache.stats().cache_used, 0);

        // without a worker full blocks are written right away
        cache.write(&r, 1, &pattern(9, 8), 8).unwrap();
        assert_eq!(&mem.contents()[8..16], &pattern(9, 8)[..]);
        cache.shutdown();
    }

    #[test]
    fn test_concurrent_files() {
        let cache = Arc::new(BlockCache::new(CacheConfig::with_blocks(16, 4)).unwrap());
        let mut threads = Vec::new();
        for t in 0..4u64 {
            let cache = cache.clone();
            threads.push(std::thread::spawn(move || {
                let mem = Arc::new(MemFile::new());
                let r = remote(&mem);
                let data = pattern(t as u8, 700);
                for (i, part) in data.chunks(7).enumerate() {
                    cache.write(&r, t, part, (i * 7) as u64).unwrap();
                }
                cache.flush(t).unwrap();
                assert_eq!(mem.contents(), data);

                let mut buf = vec![0u8; 700];
                assert_eq!(cache.read_through(&r, t, &mut buf, 0), Ok(700));
                assert_eq!(buf, data);
                cache.close(&r, t).unwrap();
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        // forced write backs of partial blocks only add to this
        assert!(cache.stats().blocks_written >= 4 * 44);
    }
}
