pub mod cache;
pub mod config;
pub mod logger;
pub mod store;
pub mod utils;

pub use cache::{BlockCache, CacheStats, FileRef, FileState, WriteError};
pub use config::CacheConfig;
pub use store::{Errno, FileStore, LocalFile, MemFile, RemoteFile};
