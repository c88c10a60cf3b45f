pub struct BitMap {
    data: Vec<u64>,
    size: u64,
    count: u64,
    cursor: u64,
}

impl BitMap {
    pub fn new(size: u64) -> Self {
        let words = size.div_ceil(64);
        Self {
            data: vec![0u64; words as usize],
            size,
            count: 0,
            cursor: 0,
        }
    }

    pub fn add(&mut self, bit: u64) -> bool {
        if bit >= self.size || self.test(bit) {
            return false;
        }
        self.data[(bit >> 6) as usize] |= 1 << (bit & 63);
        self.count += 1;
        true
    }

    pub fn test(&self, bit: u64) -> bool {
        if bit >= self.size {
            return false;
        }
        (self.data[(bit >> 6) as usize] & (1 << (bit & 63))) != 0
    }

    pub fn del(&mut self, bit: u64) -> bool {
        if !self.test(bit) {
            return false;
        }
        self.data[(bit >> 6) as usize] &= !(1 << (bit & 63));
        self.count -= 1;
        true
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn cap(&self) -> u64 {
        self.size
    }

    pub fn full(&self) -> bool {
        self.len() == self.cap()
    }

    /// set and return the first clear bit at or after the last allocation,
    /// wrapping once, so freed bits are not handed out again right away
    pub fn alloc(&mut self) -> Option<u64> {
        if self.full() {
            return None;
        }
        let start = self.cursor;
        let bit = self.find_zero_from(start).or_else(|| self.find_zero_from(0))?;
        self.add(bit);
        self.cursor = if bit + 1 >= self.size { 0 } else { bit + 1 };
        Some(bit)
    }

    fn find_zero_from(&self, start: u64) -> Option<u64> {
        let mut bit = start;
        while bit < self.size {
            let word = self.data[(bit >> 6) as usize];
            if word == u64::MAX && bit & 63 == 0 {
                bit += 64;
                continue;
            }
            if word & (1 << (bit & 63)) == 0 {
                return Some(bit);
            }
            bit += 1;
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::BitMap;

    #[test]
    fn test_bitmap() {
        let mut bm = BitMap::new(1024);

        bm.add(233);
        bm.add(666);

        assert!(bm.test(233));
        assert!(bm.test(666));
        assert!(!bm.test(101));
        assert!(!bm.test(4096));

        bm.del(233);
        assert!(!bm.test(233));
        assert_eq!(bm.len(), 1);
        assert!(!bm.del(233));
    }

    #[test]
    fn test_bitmap_alloc() {
        let mut bm = BitMap::new(70);
        let mut v = Vec::new();
        while let Some(x) = bm.alloc() {
            v.push(x);
        }
        assert_eq!(v.len(), 70);
        assert_eq!(v[0], 0);
        assert_eq!(v[69], 69);
        assert!(bm.full());

        bm.del(3);
        bm.del(65);
        // wraps back to the lowest free bit
        assert_eq!(bm.alloc(), Some(3));
        assert_eq!(bm.alloc(), Some(65));
        assert_eq!(bm.alloc(), None);
    }
}
