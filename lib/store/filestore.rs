use crate::store::{to_errno, Errno, RemoteFile};
use std::io::ErrorKind;
use std::os::unix::prelude::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const DATA_SHARD_BITS: u64 = 8;
const DATA_SHARD_MASK: u64 = (1 << DATA_SHARD_BITS) - 1;

/// A directory standing in for the remote backend, one data file per inode
/// under `root/xx/yy/ino` where `xx` and `yy` are the low inode bytes.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, Errno> {
        let root = root.as_ref().to_path_buf();
        if let Err(e) = std::fs::create_dir_all(&root) {
            log::error!("can't create data root {:?} error {}", root, e);
            return Err(to_errno(&e));
        }
        Ok(Self { root })
    }

    fn shard(ino: u64) -> (u8, u8) {
        let s1 = (ino & DATA_SHARD_MASK) as u8;
        let s2 = ((ino >> DATA_SHARD_BITS) & DATA_SHARD_MASK) as u8;
        (s1, s2)
    }

    fn build_dir(&self, ino: u64) -> PathBuf {
        let (s1, s2) = Self::shard(ino);
        self.root.join(format!("{:02x}", s1)).join(format!("{:02x}", s2))
    }

    pub fn build_path(&self, ino: u64) -> PathBuf {
        self.build_dir(ino).join(ino.to_string())
    }

    fn fsync_dir(path: &Path) {
        match std::fs::File::open(path) {
            Ok(dir) => {
                if let Err(e) = dir.sync_all() {
                    log::error!("can't sync dir {:?} error {}", path, e);
                }
            }
            Err(e) => {
                log::error!("can't open dir {:?} error {}", path, e);
            }
        }
    }

    /// open the data file of `ino`, creating it when `create` is set
    pub fn open(&self, ino: u64, create: bool) -> Result<LocalFile, Errno> {
        let fpath = self.build_path(ino);
        if create {
            let dir = self.build_dir(ino);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                log::error!("can't create dir {:?} error {}", dir, e);
                return Err(to_errno(&e));
            }
        }
        let r = std::fs::File::options()
            .read(true)
            .write(true)
            .create(create)
            .open(&fpath);
        match r {
            Ok(fp) => {
                if create {
                    Self::fsync_dir(&self.build_dir(ino));
                }
                Ok(LocalFile {
                    ino,
                    fp: Mutex::new(Some(fp)),
                })
            }
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    log::error!("can't open {:?} error {}", fpath, e);
                }
                Err(to_errno(&e))
            }
        }
    }

    pub fn unlink(&self, ino: u64) {
        let p = self.build_path(ino);
        match std::fs::remove_file(&p) {
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    log::error!("can't remove {:?} error {}", p, e);
                }
            }
            Ok(_) => {
                Self::fsync_dir(&self.build_dir(ino));
                log::info!("remove file {:?}", p);
            }
        }
    }
}

pub struct LocalFile {
    ino: u64,
    fp: Mutex<Option<std::fs::File>>,
}

impl LocalFile {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    fn with_fp<F, R>(&self, f: F) -> Result<R, Errno>
    where
        F: FnOnce(&std::fs::File) -> std::io::Result<R>,
    {
        let fp = self.fp.lock().unwrap();
        match fp.as_ref() {
            None => Err(libc::EBADF),
            Some(fp) => f(fp).map_err(|e| {
                log::error!("io on ino {} fail, error {}", self.ino, e);
                to_errno(&e)
            }),
        }
    }
}

impl RemoteFile for LocalFile {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        self.with_fp(|fp| {
            let mut n = 0;
            while n < buf.len() {
                match fp.read_at(&mut buf[n..], off + n as u64) {
                    Ok(0) => break,
                    Ok(x) => n += x,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(n)
        })
    }

    fn write_at(&self, off: u64, data: &[u8]) -> Result<(), Errno> {
        self.with_fp(|fp| fp.write_all_at(data, off))
    }

    fn sync(&self) -> Result<(), Errno> {
        self.with_fp(|fp| fp.sync_data())
    }

    fn truncate(&self, len: u64) -> Result<(), Errno> {
        self.with_fp(|fp| fp.set_len(len))
    }

    fn close(&self) -> Result<(), Errno> {
        let fp = self.fp.lock().unwrap().take();
        match fp {
            None => Err(libc::EBADF),
            Some(fp) => fp.sync_all().map_err(|e| to_errno(&e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::FileStore;
    use crate::store::RemoteFile;

    #[test]
    fn test_filestore() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");

        assert_eq!(store.open(0x1234, false).err(), Some(libc::ENOENT));

        let f = store.open(0x1234, true).expect("create");
        assert!(store.build_path(0x1234).ends_with("34/12/4660"));
        f.write_at(10, b"hello").expect("write");
        f.write_at(0, b"0123456789").expect("write");

        let mut buf = [0u8; 32];
        let n = f.read_at(0, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"0123456789hello");

        f.truncate(4).expect("truncate");
        let n = f.read_at(0, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"0123");

        f.sync().expect("sync");
        f.close().expect("close");
        assert_eq!(f.write_at(0, b"x"), Err(libc::EBADF));

        let f = store.open(0x1234, false).expect("reopen");
        let n = f.read_at(2, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"23");

        store.unlink(0x1234);
        assert!(!store.build_path(0x1234).exists());
    }
}
