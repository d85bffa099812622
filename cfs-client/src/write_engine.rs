//! Per-inode write path: dirty-block coalescing, the bounded
//! block-cache pool, per-chunk scheduling and the pipelined chain-write
//! worker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use cfs_api_types::{
    block_index_of, chunk_index_of, chunk_start_offset, CsChain, EngineConfig, EngineError, RetryableError,
    ServerDescriptor, BLOCK_SIZE, MAX_FILE_SIZE,
};

use crate::chunk_lock::ChunkLock;
use crate::chunk_loc_cache::ChunkLocCache;
use crate::conn_pool::{ConnPool, TcpPooledSocket};
use crate::cs_order::CSServerOrder;
use crate::inode_length::{InodeLengthRegistry, LengthChangeObserver};
use crate::master::{MasterClient, MasterOpFlags, MasterOutcome};
use crate::retry::{
    chunk_server_retry_delay, connect_retry_delay, master_retry_delay, MAX_CONNECT_ATTEMPTS, NOT_DONE_RETRY_DELAY,
};
use crate::transport;
use crate::wire::{self, cmd, CsStatus, WriteDataFrame, WriteFinishFrame, WriteOpenFrame, WriteStatusFrame};

/// Per-inode cap on simultaneously scheduled `chunkdata` jobs.
pub const MAX_SIM_CHUNKS: usize = 16;
/// Nagle-like coalescing delay before a partially-filled tail block is sent
/// anyway.
const NEXT_BLOCK_DELAY: Duration = Duration::from_millis(50);
/// Keep-alive cadence while a chain connection is idle.
const WORKER_NOP_INTERVAL: Duration = Duration::from_secs(1);
/// Cap on blocks sent but not yet acked (`waitforstatus < 64`).
const MAX_OUTSTANDING_STATUSES: usize = 64;
/// Per-connection inactivity timeout between received bytes.
const CHUNKSERVER_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(2);
const WORKER_BUSY_WAIT_FOR_STATUS: Duration = Duration::from_secs(5);
/// Extra grace period folded into the busy timeout when the worker pool
/// isn't heavily loaded.
const WORKER_BUSY_IDLE_GRACE: Duration = Duration::from_secs(20);

/// Bounded pool of dirty-block buffers.
/// `cacheblockcount = cache_mb * 1024 * 1024 / BLOCK_SIZE`; acquisition
/// blocks (via the semaphore's own waiter queue, playing the role of a
/// condition variable) while the pool is exhausted.
struct BlockPool {
    total: usize,
    free: Arc<Semaphore>,
}

impl BlockPool {
    fn new(cache_mb: usize) -> Self {
        let total = ((cache_mb * 1024 * 1024) / BLOCK_SIZE as usize).max(1);
        Self {
            total,
            free: Arc::new(Semaphore::new(total)),
        }
    }

    async fn acquire(&self) -> OwnedSemaphorePermit {
        self.free.clone().acquire_owned().await.expect("block pool semaphore never closes")
    }

    /// True once free blocks drop below a third of the pool, used by a
    /// façade to apply write back-pressure.
    fn almost_full(&self) -> bool {
        self.free.available_permits() < self.total / 3
    }
}

/// One coalesced dirty range within a chunk's block `block_pos`.
/// `from`/`to` are byte offsets within the block (`0..=BLOCK_SIZE`);
/// `writeid` is `0` until the worker has sent it.
struct CBlock {
    block_pos: u16,
    from: u32,
    to: u32,
    writeid: u32,
    data: BytesMut,
    _permit: OwnedSemaphorePermit,
}

impl CBlock {
    fn is_full(&self) -> bool {
        self.to - self.from == BLOCK_SIZE
    }

    fn contiguous_or_overlaps(&self, from: u32, to: u32) -> bool {
        from <= self.to && to >= self.from
    }

    /// Expand this block in place to also cover `[from, to)`, splicing
    /// `data` in at its offset. Assumes [`Self::contiguous_or_overlaps`].
    fn expand(&mut self, from: u32, to: u32, data: &[u8]) {
        let new_from = self.from.min(from);
        let new_to = self.to.max(to);
        let mut merged = BytesMut::zeroed((new_to - new_from) as usize);
        let old_start = (self.from - new_from) as usize;
        merged[old_start..old_start + self.data.len()].copy_from_slice(&self.data);
        let new_start = (from - new_from) as usize;
        merged[new_start..new_start + data.len()].copy_from_slice(data);
        self.from = new_from;
        self.to = new_to;
        self.data = merged;
    }
}

#[derive(Default)]
struct ChunkWorkerState {
    scheduled: bool,
    ready: bool,
    done: bool,
    flush_requested: bool,
    error: Option<EngineError>,
}

/// Per-`(inode, chunk_index)` dirty-block queue and worker coordination.
struct ChunkEntry {
    blocks: parking_lot::Mutex<VecDeque<CBlock>>,
    state: parking_lot::Mutex<ChunkWorkerState>,
    data_notify: Notify,
    ready_notify: Notify,
    done_notify: Notify,
}

impl ChunkEntry {
    fn new() -> Self {
        Self {
            blocks: parking_lot::Mutex::new(VecDeque::new()),
            state: parking_lot::Mutex::new(ChunkWorkerState::default()),
            data_notify: Notify::new(),
            ready_notify: Notify::new(),
            done_notify: Notify::new(),
        }
    }
}

struct InodeWriteEntry {
    max_fleng: AtomicU64,
    lcnt: AtomicU32,
    chunks: parking_lot::Mutex<HashMap<u32, Arc<ChunkEntry>>>,
    active_count: parking_lot::Mutex<usize>,
    pending: parking_lot::Mutex<VecDeque<u32>>,
    status: parking_lot::Mutex<Option<EngineError>>,
}

impl InodeWriteEntry {
    fn new(fleng: u64) -> Self {
        Self {
            max_fleng: AtomicU64::new(fleng),
            lcnt: AtomicU32::new(0),
            chunks: parking_lot::Mutex::new(HashMap::new()),
            active_count: parking_lot::Mutex::new(0),
            pending: parking_lot::Mutex::new(VecDeque::new()),
            status: parking_lot::Mutex::new(None),
        }
    }
}

/// Opaque per-inode write handle, released via [`WriteEngine::close`].
#[derive(Debug, Clone, Copy)]
pub struct WriteHandle {
    pub inode: u64,
}

pub struct WriteEngine {
    master: Arc<dyn MasterClient>,
    conn_pool: Arc<dyn ConnPool>,
    chunk_lock: Arc<ChunkLock>,
    loc_cache: Arc<ChunkLocCache>,
    cs_order: Arc<CSServerOrder>,
    inode_length: Arc<InodeLengthRegistry>,
    /// Notified of this engine's own writes so the read side can drop
    /// buffers overlapping a just-written range.
    read_observer: Arc<dyn LengthChangeObserver>,
    config: EngineConfig,
    pool: Arc<BlockPool>,
    inodes: parking_lot::Mutex<HashMap<u64, Arc<InodeWriteEntry>>>,
    next_writeid: Arc<AtomicU32>,
}

impl WriteEngine {
    pub fn new(
        master: Arc<dyn MasterClient>,
        conn_pool: Arc<dyn ConnPool>,
        chunk_lock: Arc<ChunkLock>,
        loc_cache: Arc<ChunkLocCache>,
        cs_order: Arc<CSServerOrder>,
        inode_length: Arc<InodeLengthRegistry>,
        read_observer: Arc<dyn LengthChangeObserver>,
        config: EngineConfig,
    ) -> Self {
        let pool = Arc::new(BlockPool::new(config.write_cache_mb()));
        Self {
            master,
            conn_pool,
            chunk_lock,
            loc_cache,
            cs_order,
            inode_length,
            read_observer,
            config,
            pool,
            inodes: parking_lot::Mutex::new(HashMap::new()),
            next_writeid: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn write_cache_almost_full(&self) -> bool {
        self.pool.almost_full()
    }

    pub fn open(&self, inode: u64, fleng: u64) -> WriteHandle {
        self.inode_length.open(inode, fleng);
        let entry = self
            .inodes
            .lock()
            .entry(inode)
            .or_insert_with(|| Arc::new(InodeWriteEntry::new(fleng)))
            .clone();
        entry.lcnt.fetch_add(1, Ordering::SeqCst);
        WriteHandle { inode }
    }

    fn inode_entry(&self, inode: u64) -> Arc<InodeWriteEntry> {
        self.inodes
            .lock()
            .entry(inode)
            .or_insert_with(|| Arc::new(InodeWriteEntry::new(0)))
            .clone()
    }

    pub fn get_max_fleng(&self, inode: u64) -> u64 {
        self.inode_entry(inode).max_fleng.load(Ordering::SeqCst)
    }

    pub fn get_max_fleng_handle(&self, handle: WriteHandle) -> u64 {
        self.get_max_fleng(handle.inode)
    }

    pub fn set_max_fleng(&self, inode: u64, len: u64) {
        let entry = self.inode_entry(inode);
        let mut cur = entry.max_fleng.load(Ordering::SeqCst);
        while len > cur {
            match entry.max_fleng.compare_exchange(cur, len, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Append `data` at `offset`, coalescing into the dirty-block cache.
    /// Blocks on the free-block pool when it is exhausted. `privileged` is
    /// accepted for parity with the write entry point's signature but this
    /// engine does not apply a different admission policy for it (no quota
    /// pre-check happens client-side either way).
    pub async fn write(&self, handle: WriteHandle, offset: u64, data: Bytes, _privileged: bool) -> Result<(), EngineError> {
        if offset >= MAX_FILE_SIZE || offset + data.len() as u64 >= MAX_FILE_SIZE {
            return Err(EngineError::TooBig);
        }
        if let Some(err) = self.inode_entry(handle.inode).status.lock().clone() {
            return Err(err);
        }

        let mut remaining = data;
        let mut pos = offset;
        while !remaining.is_empty() {
            let chunk_index = chunk_index_of(pos);
            let chunk_end = chunk_start_offset(chunk_index + 1);
            let block_pos = block_index_of(pos);
            let block_start = chunk_start_offset(chunk_index) + (block_pos as u64) * BLOCK_SIZE as u64;
            let block_end = (block_start + BLOCK_SIZE as u64).min(chunk_end);
            let take = remaining.len().min((block_end - pos) as usize);
            let chunk_data = remaining.split_to(take);
            let from = (pos - block_start) as u32;
            let to = from + take as u32;
            self.write_block(handle.inode, chunk_index, block_pos, from, to, chunk_data).await?;
            pos += take as u64;
        }

        self.set_max_fleng(handle.inode, pos);
        Ok(())
    }

    async fn write_block(&self, inode: u64, chunk_index: u32, block_pos: u16, from: u32, to: u32, data: Bytes) -> Result<(), EngineError> {
        let permit = self.pool.acquire().await;
        let inode_entry = self.inode_entry(inode);
        let chunk_entry = inode_entry.chunks.lock().entry(chunk_index).or_insert_with(|| Arc::new(ChunkEntry::new())).clone();

        {
            let mut blocks = chunk_entry.blocks.lock();
            let expanded = match blocks.back_mut() {
                Some(tail) if tail.writeid == 0 && tail.block_pos == block_pos && tail.contiguous_or_overlaps(from, to) => {
                    tail.expand(from, to, &data);
                    true
                }
                _ => false,
            };
            if !expanded {
                blocks.push_back(CBlock {
                    block_pos,
                    from,
                    to,
                    writeid: 0,
                    data: BytesMut::from(&data[..]),
                    _permit: permit,
                });
            }
        }
        chunk_entry.data_notify.notify_waiters();
        self.schedule(inode, chunk_index, &inode_entry, &chunk_entry);
        Ok(())
    }

    /// Join a `chunkdata` job to the run queue: starts immediately if the
    /// inode is under `MAX_SIM_CHUNKS`, otherwise waits in `pending` until
    /// [`Self::test_chunkdata`] promotes it.
    fn schedule(&self, inode: u64, chunk_index: u32, inode_entry: &Arc<InodeWriteEntry>, chunk_entry: &Arc<ChunkEntry>) {
        let mut state = chunk_entry.state.lock();
        if state.scheduled {
            return;
        }
        let mut active = inode_entry.active_count.lock();
        if *active < MAX_SIM_CHUNKS {
            *active += 1;
            state.scheduled = true;
            drop(state);
            drop(active);
            self.dispatch(inode, chunk_index, inode_entry.clone(), chunk_entry.clone());
        } else {
            inode_entry.pending.lock().push_back(chunk_index);
        }
    }

    /// Promote the next pending `chunkdata` once a running one completes.
    fn test_chunkdata(&self, inode: u64, inode_entry: &Arc<InodeWriteEntry>) {
        let mut active = inode_entry.active_count.lock();
        *active = active.saturating_sub(1);
        let Some(chunk_index) = inode_entry.pending.lock().pop_front() else {
            return;
        };
        let Some(chunk_entry) = inode_entry.chunks.lock().get(&chunk_index).cloned() else {
            return;
        };
        *active += 1;
        chunk_entry.state.lock().scheduled = true;
        drop(active);
        self.dispatch(inode, chunk_index, inode_entry.clone(), chunk_entry);
    }

    fn dispatch(&self, inode: u64, chunk_index: u32, inode_entry: Arc<InodeWriteEntry>, chunk_entry: Arc<ChunkEntry>) {
        let master = self.master.clone();
        let conn_pool = self.conn_pool.clone();
        let chunk_lock = self.chunk_lock.clone();
        let loc_cache = self.loc_cache.clone();
        let cs_order = self.cs_order.clone();
        let inode_length = self.inode_length.clone();
        let read_observer = self.read_observer.clone();
        let config = self.config.clone();
        let writeid_source = self.next_writeid.clone();

        tokio::spawn(async move {
            let outcome = run_chunk_worker(
                &master,
                &conn_pool,
                &chunk_lock,
                &loc_cache,
                &cs_order,
                &inode_length,
                read_observer.as_ref(),
                &config,
                inode,
                chunk_index,
                &chunk_entry,
                &writeid_source,
            )
            .await;

            {
                let mut state = chunk_entry.state.lock();
                state.done = true;
                if let Err(err) = outcome {
                    state.error = Some(err);
                    *inode_entry.status.lock() = Some(err);
                }
            }
            chunk_entry.ready_notify.notify_waiters();
            chunk_entry.done_notify.notify_waiters();
        });
    }

    /// Block until all in-flight chunks for `handle`'s inode complete and
    /// the queue drains.
    pub async fn flush(&self, handle: WriteHandle) -> Result<(), EngineError> {
        self.flush_inode(handle.inode).await
    }

    pub async fn flush_inode(&self, inode: u64) -> Result<(), EngineError> {
        let entry = self.inode_entry(inode);
        loop {
            let chunk_entries: Vec<Arc<ChunkEntry>> = entry.chunks.lock().values().cloned().collect();
            if chunk_entries.is_empty() {
                break;
            }
            for chunk_entry in &chunk_entries {
                chunk_entry.state.lock().flush_requested = true;
                chunk_entry.data_notify.notify_waiters();
            }
            for chunk_entry in &chunk_entries {
                loop {
                    let notified = chunk_entry.done_notify.notified();
                    if chunk_entry.state.lock().done {
                        break;
                    }
                    notified.await;
                }
            }
            entry.chunks.lock().retain(|_, c| !c.state.lock().done);
            if entry.chunks.lock().is_empty() {
                break;
            }
        }
        match entry.status.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Block until every currently-known chunk for `handle`'s inode is past
    /// the `READY` negotiation phase.
    pub async fn chunk_wait(&self, handle: WriteHandle) {
        let entry = self.inode_entry(handle.inode);
        let chunk_entries: Vec<Arc<ChunkEntry>> = entry.chunks.lock().values().cloned().collect();
        for chunk_entry in chunk_entries {
            loop {
                let notified = chunk_entry.ready_notify.notified();
                {
                    let state = chunk_entry.state.lock();
                    if state.ready || state.done {
                        break;
                    }
                }
                notified.await;
            }
        }
    }

    pub async fn close(&self, handle: WriteHandle) -> Result<(), EngineError> {
        let result = self.flush(handle).await;
        let entry = self.inode_entry(handle.inode);
        if entry.lcnt.fetch_sub(1, Ordering::SeqCst) <= 1 {
            self.inodes.lock().remove(&handle.inode);
        }
        self.inode_length.close(handle.inode);
        result
    }
}

struct OutstandingBlock {
    block_pos: u16,
    end_offset: u32,
    /// Held until the ack arrives; dropping it (on removal from
    /// `outstanding`) is what returns the slot to `status_slot`.
    _permit: OwnedSemaphorePermit,
}

struct PipelineState {
    outstanding: HashMap<u32, OutstandingBlock>,
    finished_sending: bool,
    max_acked_extent: u64,
    error: Option<EngineError>,
}

/// Worker algorithm for one `chunkdata`.
#[allow(clippy::too_many_arguments)]
async fn run_chunk_worker(
    master: &Arc<dyn MasterClient>,
    conn_pool: &Arc<dyn ConnPool>,
    chunk_lock: &Arc<ChunkLock>,
    loc_cache: &Arc<ChunkLocCache>,
    cs_order: &Arc<CSServerOrder>,
    inode_length: &Arc<InodeLengthRegistry>,
    read_observer: &dyn LengthChangeObserver,
    config: &EngineConfig,
    inode: u64,
    chunk_index: u32,
    entry: &Arc<ChunkEntry>,
    writeid_source: &Arc<AtomicU32>,
) -> Result<(), EngineError> {
    let _write_guard = chunk_lock.write_lock(inode, chunk_index).await;

    let flags = MasterOpFlags::default();
    let mut master_attempt = 0u32;
    let (chunk_id, version, chain) = loop {
        match master.write_chunk(inode, chunk_index, flags).await {
            Ok(loc) => break (loc.chunk_id, loc.version, loc.chain),
            Err(status) => match crate::master::classify(status, config.error_on_lost_chunk(), config.error_on_no_space()) {
                MasterOutcome::Retry(RetryableError::NotDone) => unreachable!("master path never yields NotDone"),
                MasterOutcome::Retry(_) => {
                    tokio::time::sleep(master_retry_delay(master_attempt)).await;
                    master_attempt += 1;
                    if master_attempt > config.io_try_cnt() {
                        return Err(EngineError::Io);
                    }
                    continue;
                }
                MasterOutcome::Fail(err) => return Err(err),
            },
        }
    };

    if master.capabilities().chunk_loc_cache_eligible {
        loc_cache.insert(inode, chunk_index, chunk_id, version, chain.clone());
    }
    read_observer.invalidate_range(inode, chunk_start_offset(chunk_index), cfs_api_types::CHUNK_SIZE);

    let max_acked_extent = Arc::new(AtomicU64::new(0));
    let worker_error: Arc<parking_lot::Mutex<Option<EngineError>>> = Arc::new(parking_lot::Mutex::new(None));

    match &chain {
        CsChain::Plain(servers) => {
            let mut servers = servers.clone();
            cs_order.sort(&mut servers, true);
            run_part_worker(
                conn_pool,
                cs_order,
                &servers,
                chunk_id.0,
                version.0,
                1,
                0,
                entry,
                writeid_source,
                &max_acked_extent,
                &worker_error,
            )
            .await;
        }
        CsChain::Split(parts) => {
            let part_count = parts.len();
            let mut handles = Vec::with_capacity(part_count);
            for (part, servers) in parts.iter().enumerate() {
                let mut servers = servers.clone();
                cs_order.sort(&mut servers, true);
                let part_chunk_id = wire::split_chunk_id(chunk_id, part_count, part);
                let entry = entry.clone();
                let writeid_source = writeid_source.clone();
                let max_acked_extent = max_acked_extent.clone();
                let worker_error = worker_error.clone();
                let conn_pool = conn_pool.clone();
                let cs_order = cs_order.clone();
                let version = version.0;
                handles.push(tokio::spawn(async move {
                    run_part_worker(
                        &conn_pool,
                        &cs_order,
                        &servers,
                        part_chunk_id,
                        version,
                        part_count,
                        part,
                        &entry,
                        &writeid_source,
                        &max_acked_extent,
                        &worker_error,
                    )
                    .await;
                }));
            }
            for h in handles {
                let _ = h.await;
            }
        }
    }

    if let Some(err) = worker_error.lock().clone() {
        return Err(err);
    }

    let extent = max_acked_extent.load(Ordering::SeqCst);
    let new_fleng = chunk_start_offset(chunk_index) + extent;

    match master.write_chunk_end(inode, chunk_index, chunk_id, version, new_fleng, flags).await {
        Ok(()) => {}
        Err(status) => match crate::master::classify(status, config.error_on_lost_chunk(), config.error_on_no_space()) {
            MasterOutcome::Retry(_) => {
                // Another master op may still be in progress; this worker
                // does not hold retries open past its own lifetime, so
                // surface as a transient I/O error and let the caller's
                // next flush retry the chunk from scratch.
                return Err(EngineError::Io);
            }
            MasterOutcome::Fail(err) => return Err(err),
        },
    }

    inode_length.set_length_passive(inode, new_fleng, read_observer);
    entry.state.lock().ready = true;
    Ok(())
}

/// Drive one server chain (the whole chunk in plain mode, or one
/// erasure-coded part in split mode): establish the pipelined connection,
/// run the send/receive loops, and report the highest acked byte extent
/// (relative to the start of whichever id space `chunk_id` addresses) via
/// `max_acked_extent`, folding in the `part`/`part_count` stride so a
/// split-mode part's block-local extents translate back to chunk-relative
/// offsets.
#[allow(clippy::too_many_arguments)]
async fn run_part_worker(
    conn_pool: &Arc<dyn ConnPool>,
    cs_order: &Arc<CSServerOrder>,
    servers: &[ServerDescriptor],
    chunk_id: u64,
    version: u32,
    part_count: usize,
    part: usize,
    entry: &Arc<ChunkEntry>,
    writeid_source: &Arc<AtomicU32>,
    max_acked_extent: &Arc<AtomicU64>,
    worker_error: &Arc<parking_lot::Mutex<Option<EngineError>>>,
) {
    let Some(head) = servers.first() else {
        *worker_error.lock() = Some(EngineError::NoChunkServer);
        return;
    };

    let mut stream = match conn_pool.get(head.ip, head.port).await {
        Some(pooled) => pooled.0,
        None => {
            let mut attempt = 0;
            loop {
                match transport::dial(head.ip, head.port).await {
                    Ok(stream) => break stream,
                    Err(_) => {
                        attempt += 1;
                        if attempt >= MAX_CONNECT_ATTEMPTS {
                            *worker_error.lock() = Some(EngineError::Io);
                            return;
                        }
                        tokio::time::sleep(connect_retry_delay(attempt)).await;
                    }
                }
            }
        }
    };

    cs_order.load_table().write_inc(head.ip, head.port);

    let forward_chain: Vec<(u32, u16)> = servers[1..].iter().map(|s| (s.ip, s.port)).collect();
    let open_frame = WriteOpenFrame {
        chunk_id,
        version,
        forward_chain,
    };
    if transport::write_frame(&mut stream, &open_frame.encode()).await.is_err() {
        cs_order.load_table().write_dec(head.ip, head.port);
        *worker_error.lock() = Some(EngineError::Io);
        return;
    }

    // The chain-open ack reuses WRITE_STATUS with writeid == 0 as a
    // sentinel rather than a dedicated frame (see DESIGN.md).
    match read_open_ack(&mut stream).await {
        Ok(true) => {}
        Ok(false) => {
            cs_order.load_table().write_dec(head.ip, head.port);
            *worker_error.lock() = Some(EngineError::Io);
            return;
        }
        Err(_) => {
            cs_order.load_table().write_dec(head.ip, head.port);
            *worker_error.lock() = Some(EngineError::Io);
            return;
        }
    }

    let (read_half, write_half) = stream.into_split();
    let state = Arc::new(parking_lot::Mutex::new(PipelineState {
        outstanding: HashMap::new(),
        finished_sending: false,
        max_acked_extent: 0,
        error: None,
    }));
    let status_slot = Arc::new(Semaphore::new(MAX_OUTSTANDING_STATUSES));
    let ack_notify = Arc::new(Notify::new());

    let recv_state = state.clone();
    let recv_notify = ack_notify.clone();
    let recv_task = tokio::spawn(async move { recv_loop(read_half, recv_state, recv_notify).await });

    entry.state.lock().ready = true;
    entry.ready_notify.notify_waiters();

    send_loop(write_half, chunk_id, version, entry, &state, &status_slot, &ack_notify, writeid_source).await;

    let recv_result = recv_task.await;
    cs_order.load_table().write_dec(head.ip, head.port);

    let (acked, err) = {
        let st = state.lock();
        (st.max_acked_extent, st.error.clone())
    };
    if let Some(err) = err.or_else(|| recv_result.err().map(|_| EngineError::Io)) {
        *worker_error.lock() = Some(err);
    }

    let chunk_relative = acked.saturating_mul(part_count as u64).saturating_add(part as u64);
    let mut prev = max_acked_extent.load(Ordering::SeqCst);
    while chunk_relative > prev {
        match max_acked_extent.compare_exchange(prev, chunk_relative, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(observed) => prev = observed,
        }
    }
}

async fn read_open_ack(stream: &mut tokio::net::TcpStream) -> Result<bool, anyhow::Error> {
    loop {
        let header = tokio::time::timeout(CHUNKSERVER_ACTIVITY_TIMEOUT, transport::read_header(stream)).await??;
        match header.cmd {
            cmd::ANTOAN_NOP => continue,
            cmd::CSTOCL_WRITE_STATUS => {
                let body = tokio::time::timeout(CHUNKSERVER_ACTIVITY_TIMEOUT, transport::read_body(stream, header.leng)).await??;
                let frame = WriteStatusFrame::decode(&body)?;
                return Ok(frame.writeid == 0 && frame.status == CsStatus::Ok);
            }
            other => anyhow::bail!("unexpected chunk-server command {other} while opening write chain"),
        }
    }
}

async fn recv_loop(
    mut read_half: OwnedReadHalf,
    state: Arc<parking_lot::Mutex<PipelineState>>,
    ack_notify: Arc<Notify>,
) -> Result<(), anyhow::Error> {
    loop {
        let done = {
            let st = state.lock();
            st.finished_sending && st.outstanding.is_empty()
        };
        if done {
            return Ok(());
        }

        let header = tokio::time::timeout(CHUNKSERVER_ACTIVITY_TIMEOUT, transport::read_header(&mut read_half))
            .await
            .map_err(|_| anyhow::anyhow!("chunk server activity timeout"))??;
        match header.cmd {
            cmd::ANTOAN_NOP => continue,
            cmd::CSTOCL_WRITE_STATUS => {
                let body = tokio::time::timeout(CHUNKSERVER_ACTIVITY_TIMEOUT, transport::read_body(&mut read_half, header.leng)).await??;
                let frame = WriteStatusFrame::decode(&body)?;
                match frame.status {
                    CsStatus::Ok => {
                        let mut st = state.lock();
                        if let Some(block) = st.outstanding.remove(&frame.writeid) {
                            let extent = (block.block_pos as u64) * BLOCK_SIZE as u64 + block.end_offset as u64;
                            st.max_acked_extent = st.max_acked_extent.max(extent);
                        }
                        drop(st);
                        ack_notify.notify_waiters();
                    }
                    CsStatus::NotDone => {
                        tokio::time::sleep(NOT_DONE_RETRY_DELAY).await;
                        continue;
                    }
                    CsStatus::Error(code) => anyhow::bail!("chunk server returned write error status {code}"),
                }
            }
            other => anyhow::bail!("unexpected chunk-server command {other}"),
        }
    }
}

async fn send_loop(
    mut write_half: OwnedWriteHalf,
    chunk_id: u64,
    version: u32,
    entry: &Arc<ChunkEntry>,
    state: &Arc<parking_lot::Mutex<PipelineState>>,
    status_slot: &Arc<Semaphore>,
    ack_notify: &Arc<Notify>,
    writeid_source: &Arc<AtomicU32>,
) {
    let mut last_send = Instant::now();
    loop {
        if state.lock().error.is_some() {
            return;
        }

        let flush_requested = entry.state.lock().flush_requested;
        let ready_to_send: Vec<CBlock> = {
            let mut blocks = entry.blocks.lock();
            let mut out = Vec::new();
            while let Some(front) = blocks.front() {
                if front.writeid != 0 {
                    break;
                }
                let more_behind = blocks.len() > 1;
                let aged = last_send.elapsed() >= NEXT_BLOCK_DELAY;
                if front.is_full() || more_behind || flush_requested || aged {
                    out.push(blocks.pop_front().unwrap());
                } else {
                    break;
                }
            }
            out
        };

        for mut block in ready_to_send {
            let Ok(slot_permit) = status_slot.clone().acquire_owned().await else {
                return;
            };
            let writeid = writeid_source.fetch_add(1, Ordering::SeqCst);
            block.writeid = writeid;
            let frame = WriteDataFrame {
                chunk_id,
                writeid,
                pos: block.block_pos,
                from: block.from as u16,
                data: &block.data,
            };
            if transport::write_frame(&mut write_half, &frame.encode()).await.is_err() {
                state.lock().error = Some(EngineError::Io);
                return;
            }
            state.lock().outstanding.insert(
                writeid,
                OutstandingBlock {
                    block_pos: block.block_pos,
                    end_offset: block.to,
                    _permit: slot_permit,
                },
            );
            last_send = Instant::now();
        }

        let blocks_empty = entry.blocks.lock().is_empty();
        if blocks_empty && flush_requested {
            break;
        }

        if last_send.elapsed() >= WORKER_NOP_INTERVAL {
            if transport::write_frame(&mut write_half, &wire::encode_nop()).await.is_err() {
                state.lock().error = Some(EngineError::Io);
                return;
            }
            last_send = Instant::now();
        }

        tokio::select! {
            _ = entry.data_notify.notified() => {}
            _ = ack_notify.notified() => {}
            _ = tokio::time::sleep(NEXT_BLOCK_DELAY) => {}
        }
    }

    loop {
        let outstanding_empty = state.lock().outstanding.is_empty();
        if outstanding_empty {
            break;
        }
        let wait = tokio::time::timeout(WORKER_BUSY_WAIT_FOR_STATUS + WORKER_BUSY_IDLE_GRACE, ack_notify.notified()).await;
        if wait.is_err() {
            state.lock().error = Some(EngineError::Io);
            break;
        }
    }
    state.lock().finished_sending = true;

    if transport::write_frame(&mut write_half, &WriteFinishFrame { chunk_id, version }.encode()).await.is_err() {
        state.lock().error = Some(EngineError::Io);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permit() -> OwnedSemaphorePermit {
        let sem = Arc::new(Semaphore::new(1));
        // Leak the permit's backing semaphore for the lifetime of the test;
        // we only need a valid OwnedSemaphorePermit value, not its pool.
        let sem = Box::leak(Box::new(sem)).clone();
        futures::executor::block_on(sem.acquire_owned()).unwrap()
    }

    #[test]
    fn coalescing_expands_contiguous_tail_block() {
        let mut block = CBlock {
            block_pos: 0,
            from: 0,
            to: 10,
            writeid: 0,
            data: BytesMut::from(&b"0123456789"[..]),
            _permit: permit(),
        };
        assert!(block.contiguous_or_overlaps(10, 20));
        block.expand(10, 20, b"abcdefghij");
        assert_eq!(block.from, 0);
        assert_eq!(block.to, 20);
        assert_eq!(&block.data[..], b"0123456789abcdefghij");
    }

    #[test]
    fn coalescing_splices_overlapping_range() {
        let mut block = CBlock {
            block_pos: 0,
            from: 5,
            to: 15,
            writeid: 0,
            data: BytesMut::from(&b"AAAAAAAAAA"[..]),
            _permit: permit(),
        };
        block.expand(0, 8, b"BBBBBBBB");
        assert_eq!(block.from, 0);
        assert_eq!(block.to, 15);
        assert_eq!(&block.data[0..8], b"BBBBBBBB");
    }

    #[test]
    fn block_pool_reports_almost_full() {
        let pool = BlockPool::new(1); // 1 MiB / 64 KiB = 16 blocks
        assert_eq!(pool.total, 16);
        assert!(!pool.almost_full());
    }
}
