use crate::cache::file::{FileState, WriteError};
use crate::store::RemoteFile;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Who a block belongs to: the file it caches and, for dirty blocks, the
/// remote handle the bytes are written back through.
#[derive(Clone)]
pub struct Owner {
    pub file: Arc<FileState>,
    pub remote: Option<Arc<dyn RemoteFile>>,
}

/// One block aligned window of a file.
///
/// `pieces` maps the absolute file offset of every valid range to its
/// length. Pieces never overlap and never touch, `size_data` is the sum of
/// their lengths.
pub struct Block {
    off_start: u64,
    buf: Vec<u8>,
    pieces: BTreeMap<u64, u64>,
    size_data: u64,
    is_write: bool,
    owner: Option<Owner>,
}

impl Block {
    pub fn new(cap: usize) -> Self {
        Self {
            off_start: 0,
            buf: vec![0u8; cap],
            pieces: BTreeMap::new(),
            size_data: 0,
            is_write: false,
            owner: None,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn off_start(&self) -> u64 {
        self.off_start
    }

    pub fn size_data(&self) -> u64 {
        self.size_data
    }

    pub fn is_write(&self) -> bool {
        self.is_write
    }

    pub fn is_full(&self) -> bool {
        self.size_data == self.capacity()
    }

    pub fn owner(&self) -> Option<&Owner> {
        self.owner.as_ref()
    }

    pub fn pieces(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.pieces.iter().map(|(&off, &len)| (off, len))
    }

    /// reinitialize a pooled block for a new window and store its first piece
    pub fn recycle(&mut self, off_start: u64, is_write: bool, owner: Owner, off: u64, data: &[u8]) -> u64 {
        self.off_start = off_start;
        self.is_write = is_write;
        self.owner = Some(owner);
        self.pieces.clear();
        self.size_data = 0;
        self.add_piece(data, off)
    }

    /// drop everything but the buffer, done before the block goes back to the pool
    pub fn reset(&mut self) {
        self.pieces.clear();
        self.size_data = 0;
        self.is_write = false;
        self.owner = None;
    }

    fn contains(&self, off: u64, len: u64) -> bool {
        off >= self.off_start && off + len <= self.off_start + self.capacity()
    }

    /// copy `data` to file offset `off` and merge the range into the piece
    /// map, returns how many bytes were not cached before
    pub fn add_piece(&mut self, data: &[u8], off: u64) -> u64 {
        let len = data.len() as u64;
        if len == 0 {
            return 0;
        }
        assert!(
            self.contains(off, len),
            "piece off {} len {} outside block at {} cap {}",
            off,
            len,
            self.off_start,
            self.capacity()
        );
        let pos = (off - self.off_start) as usize;
        self.buf[pos..pos + data.len()].copy_from_slice(data);

        let mut start = off;
        let mut end = off + len;
        let mut absorbed = 0;

        // a piece before `off` that reaches it, this also covers a piece
        // starting exactly at `off`
        if let Some((&p_off, &p_len)) = self.pieces.range(..=off).next_back() {
            if p_off + p_len >= off {
                start = p_off;
                end = end.max(p_off + p_len);
                absorbed += p_len;
                self.pieces.remove(&p_off);
            }
        }

        // every following piece the new range overlaps or touches
        loop {
            let next = self.pieces.range(start..=end).next().map(|(&o, &l)| (o, l));
            match next {
                None => break,
                Some((p_off, p_len)) => {
                    end = end.max(p_off + p_len);
                    absorbed += p_len;
                    self.pieces.remove(&p_off);
                }
            }
        }

        self.pieces.insert(start, end - start);
        let added = (end - start) - absorbed;
        self.size_data += added;
        added
    }

    /// copy `buf.len()` bytes at `off` out of the block, only if one piece
    /// covers the whole range
    pub fn get_piece(&self, buf: &mut [u8], off: u64) -> bool {
        let len = buf.len() as u64;
        if len == 0 || !self.contains(off, len) {
            return false;
        }
        match self.pieces.range(..=off).next_back() {
            Some((&p_off, &p_len)) if p_off + p_len >= off + len => {
                let pos = (off - self.off_start) as usize;
                buf.copy_from_slice(&self.buf[pos..pos + buf.len()]);
                true
            }
            _ => false,
        }
    }

    /// write every piece back through the owner's remote handle, all pieces
    /// are attempted and the first failure is returned
    pub fn do_write(&self) -> Result<(), WriteError> {
        let remote = match self.owner.as_ref().and_then(|o| o.remote.as_ref()) {
            Some(r) => r,
            None => {
                return Err(WriteError {
                    errno: libc::EBADF,
                    offset: self.off_start,
                })
            }
        };
        let mut first = None;
        for (&off, &len) in &self.pieces {
            let pos = (off - self.off_start) as usize;
            if let Err(errno) = remote.write_at(off, &self.buf[pos..pos + len as usize]) {
                log::error!("write back off {} len {} fail, errno {}", off, len, errno);
                first.get_or_insert(WriteError { errno, offset: off });
            }
        }
        match first {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Block, Owner};
    use crate::cache::file::FileState;
    use crate::store::{MemFile, RemoteFile};
    use std::sync::Arc;

    fn owner(remote: Option<Arc<dyn RemoteFile>>) -> Owner {
        Owner {
            file: Arc::new(FileState::new(0, 1)),
            remote,
        }
    }

    fn block(cap: usize, off_start: u64) -> Block {
        let mut b = Block::new(cap);
        b.off_start = off_start;
        b.owner = Some(owner(None));
        b
    }

    fn pieces(b: &Block) -> Vec<(u64, u64)> {
        b.pieces().collect()
    }

    fn check_invariant(b: &Block) {
        let mut sum = 0;
        let mut last_end = None;
        for (off, len) in b.pieces() {
            assert!(len > 0);
            if let Some(e) = last_end {
                assert!(off > e, "piece at {} touches or overlaps previous end {}", off, e);
            }
            last_end = Some(off + len);
            sum += len;
        }
        assert_eq!(sum, b.size_data());
        assert!(b.size_data() <= b.capacity());
    }

    #[test]
    fn test_overlap_tail() {
        let mut b = block(64, 0);
        assert_eq!(b.add_piece(&[1u8; 10], 10), 10);
        assert_eq!(b.add_piece(&[2u8; 10], 15), 5);
        assert_eq!(pieces(&b), vec![(10, 15)]);
        assert_eq!(b.size_data(), 15);
    }

    #[test]
    fn test_rewrite_no_double_count() {
        let mut b = block(64, 0);
        b.add_piece(&[1u8; 20], 0);
        assert_eq!(b.add_piece(&[9u8; 5], 3), 0);
        assert_eq!(b.add_piece(&[9u8; 20], 0), 0);
        assert_eq!(b.size_data(), 20);

        let mut out = [0u8; 20];
        assert!(b.get_piece(&mut out, 0));
        assert_eq!(out, [9u8; 20]);
    }

    #[test]
    fn test_same_start_absorbs_following() {
        let mut b = block(64, 0);
        b.add_piece(&[1u8; 4], 0);
        b.add_piece(&[1u8; 4], 8);
        b.add_piece(&[1u8; 4], 20);
        // starts at an existing piece and runs into the third one
        assert_eq!(b.add_piece(&[2u8; 22], 0), 22 - 12 + 2);
        assert_eq!(pieces(&b), vec![(0, 24)]);
        check_invariant(&b);
    }

    #[test]
    fn test_merge_forward_and_touching() {
        let mut b = block(64, 0);
        b.add_piece(&[1u8; 4], 10);
        // ends exactly where the existing piece starts
        assert_eq!(b.add_piece(&[2u8; 4], 6), 4);
        assert_eq!(pieces(&b), vec![(6, 8)]);

        // starts exactly where the piece ends
        assert_eq!(b.add_piece(&[3u8; 2], 14), 2);
        assert_eq!(pieces(&b), vec![(6, 10)]);

        // overlaps only the following piece
        b.add_piece(&[4u8; 4], 30);
        assert_eq!(b.add_piece(&[5u8; 6], 26), 4);
        assert_eq!(pieces(&b), vec![(6, 10), (26, 8)]);
        check_invariant(&b);
    }

    #[test]
    fn test_disjoint_and_bridge() {
        let mut b = block(64, 0);
        b.add_piece(&[1u8; 4], 0);
        b.add_piece(&[1u8; 4], 40);
        assert_eq!(pieces(&b), vec![(0, 4), (40, 4)]);
        assert_eq!(b.add_piece(&[2u8; 36], 4), 36);
        assert_eq!(pieces(&b), vec![(0, 44)]);
        check_invariant(&b);
    }

    #[test]
    fn test_get_piece() {
        let mut b = block(100, 100);
        let data: Vec<u8> = (0..30).collect();
        b.add_piece(&data, 110);

        let mut out = vec![0u8; 30];
        assert!(b.get_piece(&mut out, 110));
        assert_eq!(out, data);

        let mut out = vec![0u8; 5];
        assert!(b.get_piece(&mut out, 120));
        assert_eq!(out, data[10..15].to_vec());

        // one byte past the piece
        let mut out = vec![0u8; 30];
        assert!(!b.get_piece(&mut out, 111));

        // two pieces with a hole is still a miss
        b.add_piece(&[7u8; 10], 150);
        let mut out = vec![0u8; 50];
        assert!(!b.get_piece(&mut out, 110));

        // outside the block window
        let mut out = vec![0u8; 4];
        assert!(!b.get_piece(&mut out, 98));
        assert!(!b.get_piece(&mut out, 198));
    }

    #[test]
    fn test_full_and_recycle() {
        let mut b = block(4, 0);
        b.add_piece(b"ab", 0);
        assert!(!b.is_full());
        b.add_piece(b"cd", 2);
        assert!(b.is_full());

        b.reset();
        assert!(b.owner().is_none());
        let added = b.recycle(8, true, owner(None), 9, b"xy");
        assert_eq!(added, 2);
        assert_eq!(b.off_start(), 8);
        assert!(b.is_write());
        assert_eq!(pieces(&b), vec![(9, 2)]);
    }

    #[test]
    fn test_random_sequences() {
        let cap = 256u64;
        let mut seed = 0x9e3779b97f4a7c15u64;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        for round in 0..50 {
            let mut b = block(cap as usize, 1024);
            let mut model = vec![None::<u8>; cap as usize];
            for _ in 0..40 {
                let off = next() % cap;
                let len = 1 + next() % (cap - off).min(48);
                let val = (next() & 0xff) as u8;
                let before = model.iter().filter(|x| x.is_some()).count() as u64;
                let added = b.add_piece(&vec![val; len as usize], 1024 + off);
                for x in &mut model[off as usize..(off + len) as usize] {
                    *x = Some(val);
                }
                let after = model.iter().filter(|x| x.is_some()).count() as u64;
                assert_eq!(added, after - before, "round {}", round);
                check_invariant(&b);
            }
            for (off, len) in b.pieces() {
                let mut out = vec![0u8; len as usize];
                assert!(b.get_piece(&mut out, off));
                let rel = (off - 1024) as usize;
                for (i, v) in out.iter().enumerate() {
                    assert_eq!(Some(*v), model[rel + i]);
                }
            }
        }
    }

    #[test]
    fn test_do_write() {
        let mem = Arc::new(MemFile::new());
        let mut b = Block::new(16);
        b.recycle(16, true, owner(Some(mem.clone())), 16, b"abcd");
        b.add_piece(b"wxyz", 28);
        b.do_write().expect("write back");
        assert_eq!(mem.writes(), 2);
        let data = mem.contents();
        assert_eq!(&data[16..20], b"abcd");
        assert_eq!(&data[28..32], b"wxyz");

        mem.fail_writes(true);
        let e = b.do_write().expect_err("write must fail");
        assert_eq!(e.errno, libc::EIO);
        assert_eq!(e.offset, 16);
    }
}
