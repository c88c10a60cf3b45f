use blkcache::logger::Logger;
use blkcache::utils::align_up;
use blkcache::{BlockCache, CacheConfig, FileStore, MemFile, RemoteFile};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};

// odd on purpose, most requests straddle two blocks
const IO_SIZE: usize = (96 << 10) + 13;
const FIRST_INODE: u64 = 1000;

fn byte_at(ino: u64, off: u64) -> u8 {
    (off.wrapping_mul(31).wrapping_add(ino * 7) % 251) as u8
}

fn fill(buf: &mut [u8], ino: u64, off: u64) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = byte_at(ino, off + i as u64);
    }
}

fn open_remotes(dir: &str, nfiles: u64) -> Result<Vec<(u64, Arc<dyn RemoteFile>)>, String> {
    let inodes = FIRST_INODE..FIRST_INODE + nfiles;
    if dir == "--mem" {
        return Ok(inodes.map(|ino| (ino, Arc::new(MemFile::new()) as Arc<dyn RemoteFile>)).collect());
    }
    let store = FileStore::new(dir).map_err(|e| format!("can't use {} errno {}", dir, e))?;
    let mut v = Vec::new();
    for ino in inodes {
        store.unlink(ino);
        let f = store.open(ino, true).map_err(|e| format!("can't open inode {} errno {}", ino, e))?;
        v.push((ino, Arc::new(f) as Arc<dyn RemoteFile>));
    }
    Ok(v)
}

fn write_file(
    cache: &BlockCache,
    remote: &Arc<dyn RemoteFile>,
    ino: u64,
    size: u64,
    stop: &AtomicBool,
) -> Result<u64, String> {
    let mut buf = vec![0u8; IO_SIZE];
    let mut off = 0;
    while off < size && !stop.load(Ordering::Relaxed) {
        let n = std::cmp::min(IO_SIZE as u64, size - off) as usize;
        fill(&mut buf[..n], ino, off);
        cache
            .write(remote, ino, &buf[..n], off)
            .map_err(|e| format!("inode {} write at {} errno {}", ino, off, e))?;
        off += n as u64;
    }
    cache
        .flush(ino)
        .map_err(|e| format!("inode {} flush errno {}", ino, e))?;
    Ok(off)
}

fn read_file(
    cache: &BlockCache,
    remote: &Arc<dyn RemoteFile>,
    ino: u64,
    size: u64,
    stop: &AtomicBool,
) -> Result<u64, String> {
    let mut buf = vec![0u8; IO_SIZE];
    let mut expect = vec![0u8; IO_SIZE];
    let mut off = 0;
    while off < size && !stop.load(Ordering::Relaxed) {
        let want = std::cmp::min(IO_SIZE as u64, size - off) as usize;
        let n = cache
            .read_through(remote, ino, &mut buf[..want], off)
            .map_err(|e| format!("inode {} read at {} errno {}", ino, off, e))?;
        if n != want {
            return Err(format!("inode {} short read at {}, {} of {}", ino, off, n, want));
        }
        fill(&mut expect[..n], ino, off);
        if buf[..n] != expect[..n] {
            return Err(format!("inode {} data mismatch in [{}, {})", ino, off, off + n as u64));
        }
        off += n as u64;
    }
    Ok(off)
}

#[derive(Clone, Copy)]
enum Pass {
    Write,
    Read,
}

async fn run_pass(
    name: &str,
    pass: Pass,
    cache: &Arc<BlockCache>,
    remotes: &[(u64, Arc<dyn RemoteFile>)],
    size: u64,
    stop: &Arc<AtomicBool>,
) -> Result<(), String> {
    let start = Instant::now();
    let mut tasks = Vec::new();
    for (ino, remote) in remotes {
        let (cache, remote, stop, ino) = (cache.clone(), remote.clone(), stop.clone(), *ino);
        tasks.push(tokio::task::spawn_blocking(move || match pass {
            Pass::Write => write_file(&cache, &remote, ino, size, &stop),
            Pass::Read => read_file(&cache, &remote, ino, size, &stop),
        }));
    }
    let mut bytes = 0;
    for t in tasks {
        bytes += t.await.map_err(|e| format!("{} task failed: {}", name, e))??;
    }
    let secs = start.elapsed().as_secs_f64();
    println!(
        "{:<6} {:>8.1} MiB in {:>7.3}s {:>8.1} MiB/s",
        name,
        bytes as f64 / (1 << 20) as f64,
        secs,
        bytes as f64 / (1 << 20) as f64 / secs.max(1e-9)
    );
    Ok(())
}

async fn run(
    cache: Arc<BlockCache>,
    remotes: Vec<(u64, Arc<dyn RemoteFile>)>,
    size: u64,
    stop: Arc<AtomicBool>,
) -> Result<(), String> {
    run_pass("write", Pass::Write, &cache, &remotes, size, &stop).await?;
    run_pass("cold", Pass::Read, &cache, &remotes, size, &stop).await?;
    run_pass("warm", Pass::Read, &cache, &remotes, size, &stop).await?;
    println!("{:?}", cache.stats());

    for (ino, remote) in &remotes {
        cache
            .close(remote, *ino)
            .map_err(|e| format!("inode {} close errno {}", ino, e))?;
    }
    cache.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var("BLKCACHE_LOG").unwrap_or("WARN".to_string());
    Logger::init().add_console();
    log::set_max_level(log::LevelFilter::from_str(&level).unwrap_or(log::LevelFilter::Warn));

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args.len() > 4 {
        eprintln!("{} data_dir|--mem [files] [mib_per_file]", args[0]);
        std::process::exit(1);
    }
    let nfiles: u64 = args.get(2).map(|x| x.parse::<u64>()).transpose()?.unwrap_or(4);
    let mib: u64 = args.get(3).map(|x| x.parse::<u64>()).transpose()?.unwrap_or(16);

    let cfg = CacheConfig::from_env()?;
    let size = align_up(mib << 20, cfg.block_size);
    println!(
        "{} files of {} bytes, cache {} block {}",
        nfiles, size, cfg.max_cache_size, cfg.block_size
    );
    let cache = Arc::new(BlockCache::new(cfg)?);
    let remotes = open_remotes(&args[1], nfiles)?;

    let stop = Arc::new(AtomicBool::new(false));
    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut task = tokio::spawn(run(cache.clone(), remotes, size, stop.clone()));

    let done = tokio::select! {
        r = &mut task => Some(r),
        _ = sig_int.recv() => None,
        _ = sig_term.recv() => None,
    };
    let r = match done {
        Some(r) => r,
        None => {
            println!("interrupted, finishing the current requests");
            stop.store(true, Ordering::Relaxed);
            task.await
        }
    };
    match r? {
        Ok(()) => Ok(()),
        Err(e) => {
            log::error!("{}", e);
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
