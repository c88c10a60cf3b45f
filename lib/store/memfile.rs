use crate::store::{Errno, RemoteFile};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory remote file. Writes can be made to fail or to stall, which is
/// what the cache tests and the bench's `--mem` mode need.
#[derive(Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
    writes: AtomicU64,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn delay_writes(&self, d: Duration) {
        self.write_delay_ms.store(d.as_millis() as u64, Ordering::SeqCst);
    }

    /// number of successful `write_at` calls
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl RemoteFile for MemFile {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let data = self.data.lock().unwrap();
        let off = off as usize;
        if off >= data.len() {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len(), data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    fn write_at(&self, off: u64, buf: &[u8]) -> Result<(), Errno> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(libc::EIO);
        }
        let mut data = self.data.lock().unwrap();
        let off = off as usize;
        if data.len() < off + buf.len() {
            data.resize(off + buf.len(), 0);
        }
        data[off..off + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sync(&self) -> Result<(), Errno> {
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<(), Errno> {
        self.data.lock().unwrap().resize(len as usize, 0);
        Ok(())
    }

    fn close(&self) -> Result<(), Errno> {
        Ok(())
    }
}
