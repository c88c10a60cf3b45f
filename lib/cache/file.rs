use crate::store::Errno;
use crate::utils::{BitMap, BLOCK_ADDRESS_SPACE};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A write-back that failed, kept until the next flush of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteError {
    pub errno: Errno,
    pub offset: u64,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write back at offset {} failed, errno {}", self.offset, self.errno)
    }
}

impl std::error::Error for WriteError {}

#[derive(Default)]
struct Usage {
    size_reads: u64,
    size_writes: u64,
    write_blocks: u64,
}

/// Bookkeeping of one open remote file.
pub struct FileState {
    id: u64,
    inode: u64,
    refs: AtomicU64,
    usage: Mutex<Usage>,
    writes_done: Condvar,
    errors: Mutex<VecDeque<WriteError>>,
}

impl FileState {
    pub fn new(id: u64, inode: u64) -> Self {
        Self {
            id,
            inode,
            refs: AtomicU64::new(0),
            usage: Mutex::new(Usage::default()),
            writes_done: Condvar::new(),
            errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// smallest block key of this file
    pub fn first_key(&self) -> u64 {
        self.id * BLOCK_ADDRESS_SPACE
    }

    /// first block key past this file
    pub fn last_key(&self) -> u64 {
        (self.id + 1) * BLOCK_ADDRESS_SPACE
    }

    pub fn ref_count(&self) -> u64 {
        self.refs.load(Ordering::SeqCst)
    }

    fn get(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn put(&self) {
        let r = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |x| x.checked_sub(1));
        if r.is_err() {
            log::error!("put on unreferenced file inode {}", self.inode);
        }
    }

    pub fn size_reads(&self) -> u64 {
        self.usage.lock().unwrap().size_reads
    }

    pub fn size_writes(&self) -> u64 {
        self.usage.lock().unwrap().size_writes
    }

    pub fn write_blocks(&self) -> u64 {
        self.usage.lock().unwrap().write_blocks
    }

    pub fn incr_reads(&self, n: u64) {
        self.usage.lock().unwrap().size_reads += n;
    }

    pub fn decr_reads(&self, n: u64) {
        let mut u = self.usage.lock().unwrap();
        assert!(u.size_reads >= n, "inode {} reads {} below {}", self.inode, u.size_reads, n);
        u.size_reads -= n;
    }

    pub fn incr_writes(&self, n: u64, new_block: bool) {
        let mut u = self.usage.lock().unwrap();
        u.size_writes += n;
        if new_block {
            u.write_blocks += 1;
        }
    }

    /// account a finished write-back, wakes the flush waiters once nothing
    /// dirty is left
    pub fn decr_writes(&self, n: u64, block_done: bool) {
        let mut u = self.usage.lock().unwrap();
        assert!(u.size_writes >= n, "inode {} writes {} below {}", self.inode, u.size_writes, n);
        u.size_writes -= n;
        if block_done {
            u.write_blocks = u.write_blocks.saturating_sub(1);
        }
        if u.size_writes == 0 {
            self.writes_done.notify_all();
        }
    }

    pub fn wait_writes_done(&self) {
        let u = self.usage.lock().unwrap();
        let _u = self.writes_done.wait_while(u, |u| u.size_writes != 0).unwrap();
    }

    /// false if dirty bytes are still pending after `d`
    pub fn wait_writes_done_for(&self, d: Duration) -> bool {
        let u = self.usage.lock().unwrap();
        let (_u, r) = self
            .writes_done
            .wait_timeout_while(u, d, |u| u.size_writes != 0)
            .unwrap();
        !r.timed_out()
    }

    /// a file is idle once it caches nothing and has no unreported write
    /// errors, only `strong == false` tolerates the caller's own reference
    pub fn is_idle(&self, strong: bool) -> bool {
        let limit = if strong { 0 } else { 1 };
        if self.ref_count() > limit || self.has_errors() {
            return false;
        }
        let u = self.usage.lock().unwrap();
        u.size_reads == 0 && u.size_writes == 0
    }

    pub fn push_error(&self, e: WriteError) {
        self.errors.lock().unwrap().push_back(e);
    }

    /// empty the error queue and return its oldest entry
    pub fn take_error(&self) -> Option<WriteError> {
        let mut q = self.errors.lock().unwrap();
        let first = q.pop_front();
        q.clear();
        first
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().unwrap().is_empty()
    }
}

/// A counted reference to a [`FileState`], released on drop.
pub struct FileRef {
    file: Arc<FileState>,
}

impl FileRef {
    fn new(file: Arc<FileState>) -> Self {
        file.get();
        Self { file }
    }

    pub fn file(&self) -> &Arc<FileState> {
        &self.file
    }
}

impl Clone for FileRef {
    fn clone(&self) -> Self {
        Self::new(self.file.clone())
    }
}

impl Deref for FileRef {
    type Target = FileState;

    fn deref(&self) -> &FileState {
        &self.file
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        self.file.put();
    }
}

struct Files {
    by_inode: HashMap<u64, Arc<FileState>>,
    ids: BitMap,
}

/// Inode to [`FileState`] map plus the pool of small file ids.
pub struct FileTable {
    inner: Mutex<Files>,
}

impl FileTable {
    pub fn new(max_files: u64) -> Self {
        Self {
            inner: Mutex::new(Files {
                by_inode: HashMap::new(),
                ids: BitMap::new(max_files),
            }),
        }
    }

    pub fn lookup(&self, inode: u64) -> Option<FileRef> {
        let files = self.inner.lock().unwrap();
        files.by_inode.get(&inode).cloned().map(FileRef::new)
    }

    /// `None` means every file id is taken
    pub fn get_or_create(&self, inode: u64) -> Option<FileRef> {
        let mut files = self.inner.lock().unwrap();
        if let Some(f) = files.by_inode.get(&inode) {
            return Some(FileRef::new(f.clone()));
        }
        let id = files.ids.alloc()?;
        let f = Arc::new(FileState::new(id, inode));
        files.by_inode.insert(inode, f.clone());
        log::debug!("new file inode {} id {}", inode, id);
        Some(FileRef::new(f))
    }

    /// drop `file` from the table if it is idle, its id becomes reusable
    pub fn remove(&self, file: &FileState, strong: bool) -> bool {
        let mut files = self.inner.lock().unwrap();
        match files.by_inode.get(&file.inode) {
            Some(f) if std::ptr::eq(f.as_ref(), file) => {}
            _ => return false,
        }
        if !file.is_idle(strong) {
            return false;
        }
        files.by_inode.remove(&file.inode);
        files.ids.del(file.id);
        log::debug!("remove file inode {} id {}", file.inode, file.id);
        true
    }

    pub fn remove_inode(&self, inode: u64, strong: bool) -> bool {
        let f = self.inner.lock().unwrap().by_inode.get(&inode).cloned();
        match f {
            None => false,
            Some(f) => self.remove(&f, strong),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_inode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
