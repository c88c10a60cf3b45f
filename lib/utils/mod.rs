mod bitmap;

pub use bitmap::BitMap;

/// numeric width reserved for one file's blocks in the key space, a file may
/// be at most this many bytes long (about 90 TiB)
pub const BLOCK_ADDRESS_SPACE: u64 = 100_000_000_000_000;

pub const DEFAULT_BLOCK_SIZE: u64 = 4 << 20;
pub const DEFAULT_CACHE_SIZE: u64 = 256 << 20;
pub const DEFAULT_MAX_FILES: u64 = 65536;
pub const DEFAULT_FORCE_WRITE_TIMEOUT_MS: u64 = 250;

pub const fn align_up(size: u64, align: u64) -> u64 {
    size.div_ceil(align) * align
}

pub const fn align_down(off: u64, align: u64) -> u64 {
    off - off % align
}

#[cfg(test)]
mod test {
    use super::{align_down, align_up};

    #[test]
    fn test_align() {
        assert_eq!(align_down(0, 4), 0);
        assert_eq!(align_down(7, 4), 4);
        assert_eq!(align_down(8, 4), 8);
        assert_eq!(align_down(25, 10), 20);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(11, 10), 20);
    }
}
