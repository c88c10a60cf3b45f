mod filestore;
mod memfile;

pub use filestore::{FileStore, LocalFile};
pub use memfile::MemFile;

/// POSIX error number as returned to the fuse layer
pub type Errno = i32;

/// An open file on the remote storage backend.
///
/// The cache only ever writes committed bytes through this handle, the
/// filesystem layer uses the rest of it directly.
pub trait RemoteFile: Send + Sync {
    /// read into `buf` starting at `off`, returns the number of bytes read,
    /// which is short only at end of file
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<usize, Errno>;

    fn write_at(&self, off: u64, data: &[u8]) -> Result<(), Errno>;

    fn sync(&self) -> Result<(), Errno>;

    fn truncate(&self, len: u64) -> Result<(), Errno>;

    fn close(&self) -> Result<(), Errno>;
}

pub(crate) fn to_errno(e: &std::io::Error) -> Errno {
    e.raw_os_error().unwrap_or(libc::EIO)
}
