use crate::cache::block::Block;
use crate::cache::index::CacheIndex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub(crate) enum WriteReq {
    Block(Block),
    Stop,
}

/// Producer side of the write-back queue, blocks are written in push order.
pub(crate) struct WriteQueue {
    tx: UnboundedSender<WriteReq>,
}

impl WriteQueue {
    pub(crate) fn new() -> (Self, UnboundedReceiver<WriteReq>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    /// hands the block back when the worker is gone
    pub(crate) fn push(&self, b: Block) -> Result<(), Block> {
        self.tx.send(WriteReq::Block(b)).map_err(|e| match e.0 {
            WriteReq::Block(b) => b,
            WriteReq::Stop => unreachable!("only blocks are pushed"),
        })
    }

    pub(crate) fn stop(&self) {
        if self.tx.send(WriteReq::Stop).is_err() {
            log::warn!("write back worker already stopped");
        }
    }
}

pub(crate) fn spawn(index: Arc<CacheIndex>, rx: UnboundedReceiver<WriteReq>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("blkcache-writer".to_string())
        .spawn(move || run(index, rx))
}

fn run(index: Arc<CacheIndex>, mut rx: UnboundedReceiver<WriteReq>) {
    log::info!("write back worker start");
    let mut nblocks = 0u64;
    while let Some(req) = rx.blocking_recv() {
        match req {
            WriteReq::Stop => {
                // later pushes fail and are written by their callers, what
                // is already queued still goes out
                rx.close();
            }
            WriteReq::Block(b) => {
                process(&index, b);
                nblocks += 1;
            }
        }
    }
    log::info!("write back worker stop, {} blocks written", nblocks);
}

/// write one dirty block back and return it to the pool, a failure is
/// queued on the owning file and never stops the caller
pub(crate) fn process(index: &CacheIndex, block: Block) {
    let start = Instant::now();
    let r = block.do_write();
    index
        .counters()
        .record_write_back(start.elapsed().as_nanos() as u64, r.is_ok());

    let file = block.owner().map(|o| o.file.clone());
    index.release(block.capacity());
    match file {
        None => log::error!("dirty block at {} has no owner", block.off_start()),
        Some(ref f) => {
            if let Err(e) = r {
                log::error!("inode {} {}", f.inode(), e);
                f.push_error(e);
            }
            f.decr_writes(block.size_data(), true);
        }
    }
    index.pool().give_back(block);

    if let Some(f) = file {
        index.files().remove(&f, true);
    }
}
