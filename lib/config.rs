use crate::utils::{
    BLOCK_ADDRESS_SPACE, DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_SIZE, DEFAULT_FORCE_WRITE_TIMEOUT_MS, DEFAULT_MAX_FILES,
};
use std::str::FromStr;
use std::time::Duration;

/// Tunables of a [`BlockCache`](crate::BlockCache), fixed for the lifetime of the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// total bytes of resident blocks, counted in whole blocks
    pub max_cache_size: u64,
    /// capacity of every block, blocks are aligned on this size
    pub block_size: u64,
    /// fraction of `max_cache_size`, when finished write-backs bring the
    /// occupancy back below it blocked writers are woken up
    pub evict_high_watermark: f64,
    /// fraction of `max_cache_size`, when set an eviction pass keeps dropping
    /// read blocks until the occupancy is at or below it
    pub evict_low_watermark: Option<f64>,
    /// fraction of `max_cache_size` that allocated blocks may reach before
    /// taking a block from the pool blocks
    pub pool_hard_ceiling: f64,
    pub force_write_timeout_ms: u64,
    /// number of files that may hold cached blocks at the same time
    pub max_files: u64,
    pub cache_read: bool,
    pub cache_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_CACHE_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            evict_high_watermark: 0.9,
            evict_low_watermark: None,
            pool_hard_ceiling: 1.15,
            force_write_timeout_ms: DEFAULT_FORCE_WRITE_TIMEOUT_MS,
            max_files: DEFAULT_MAX_FILES,
            cache_read: true,
            cache_write: true,
        }
    }
}

fn parse<T: FromStr>(key: &str, val: &str) -> Result<T, String> {
    val.trim()
        .parse::<T>()
        .map_err(|_| format!("invalid value {:?} for {}", val, key))
}

fn parse_switch(key: &str, val: &str) -> Result<bool, String> {
    match val.trim() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("invalid switch {:?} for {}", val, key)),
    }
}

impl CacheConfig {
    /// a small cache holding `blocks` resident blocks of `block_size` bytes
    pub fn with_blocks(block_size: u64, blocks: u64) -> Self {
        // a new block is admitted only while `used + block_size < max`
        Self {
            max_cache_size: block_size * (blocks + 1),
            block_size,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup("BLKCACHE_SIZE") {
            cfg.max_cache_size = parse("BLKCACHE_SIZE", &v)?;
        }
        if let Some(v) = lookup("BLKCACHE_BLOCK_SIZE") {
            cfg.block_size = parse("BLKCACHE_BLOCK_SIZE", &v)?;
        }
        if let Some(v) = lookup("BLKCACHE_HIGH_WATERMARK") {
            cfg.evict_high_watermark = parse("BLKCACHE_HIGH_WATERMARK", &v)?;
        }
        if let Some(v) = lookup("BLKCACHE_LOW_WATERMARK") {
            cfg.evict_low_watermark = Some(parse("BLKCACHE_LOW_WATERMARK", &v)?);
        }
        if let Some(v) = lookup("BLKCACHE_POOL_CEILING") {
            cfg.pool_hard_ceiling = parse("BLKCACHE_POOL_CEILING", &v)?;
        }
        if let Some(v) = lookup("BLKCACHE_FORCE_WRITE_TIMEOUT_MS") {
            cfg.force_write_timeout_ms = parse("BLKCACHE_FORCE_WRITE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("BLKCACHE_MAX_FILES") {
            cfg.max_files = parse("BLKCACHE_MAX_FILES", &v)?;
        }
        if let Some(v) = lookup("BLKCACHE_READ") {
            cfg.cache_read = parse_switch("BLKCACHE_READ", &v)?;
        }
        if let Some(v) = lookup("BLKCACHE_WRITE") {
            cfg.cache_write = parse_switch("BLKCACHE_WRITE", &v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.block_size == 0 {
            return Err("block size must not be zero".to_string());
        }
        if self.block_size > BLOCK_ADDRESS_SPACE || self.block_size > usize::MAX as u64 {
            return Err(format!("block size {} too large", self.block_size));
        }
        if self.max_cache_size <= self.block_size {
            return Err(format!(
                "cache size {} can't hold a block of {} bytes",
                self.max_cache_size, self.block_size
            ));
        }
        let fraction = |x: f64| x > 0.0 && x <= 1.0;
        if !fraction(self.evict_high_watermark) {
            return Err(format!("high watermark {} out of (0, 1]", self.evict_high_watermark));
        }
        if let Some(low) = self.evict_low_watermark {
            if !fraction(low) {
                return Err(format!("low watermark {} out of (0, 1]", low));
            }
        }
        if self.pool_hard_ceiling.is_nan() || self.pool_hard_ceiling < 1.0 {
            return Err(format!("pool ceiling {} below 1.0", self.pool_hard_ceiling));
        }
        if self.max_files == 0 || self.max_files > u64::MAX / BLOCK_ADDRESS_SPACE {
            return Err(format!("max files {} out of key space", self.max_files));
        }
        Ok(())
    }

    pub fn force_write_timeout(&self) -> Duration {
        Duration::from_millis(self.force_write_timeout_ms)
    }

    /// occupancy below which finished write-backs wake blocked writers
    pub fn broadcast_threshold(&self) -> u64 {
        (self.max_cache_size as f64 * self.evict_high_watermark) as u64
    }

    pub fn evict_target(&self) -> Option<u64> {
        self.evict_low_watermark
            .map(|low| (self.max_cache_size as f64 * low) as u64)
    }

    pub fn pool_ceiling(&self) -> u64 {
        (self.max_cache_size as f64 * self.pool_hard_ceiling) as u64
    }
}
