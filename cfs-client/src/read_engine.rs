//! Per-inode read path: read-ahead, request planning/
//! splitting, the worker pool and plain/split-mode block reassembly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{Notify, Semaphore};

use cfs_api_types::{
    block_index_of, chunk_index_of, chunk_start_offset, ChunkId, ChunkVersion, CsChain, EngineConfig,
    EngineError, RetryableError, ServerDescriptor, BLOCK_SIZE, MAX_FILE_SIZE,
};

use crate::chunk_loc_cache::ChunkLocCache;
use crate::chunk_lock::ChunkLock;
use crate::conn_pool::{ConnPool, TcpPooledSocket};
use crate::cs_order::CSServerOrder;
use crate::inode_length::{InodeLengthRegistry, LengthChangeObserver};
use crate::master::{MasterClient, MasterOpFlags, MasterOutcome};
use crate::retry::{
    chunk_server_retry_delay, connect_retry_delay, master_retry_delay, MAX_CONNECT_ATTEMPTS, NOT_DONE_RETRY_DELAY,
};
use crate::transport;
use crate::wire::{self, cmd, logical_block_of_split, split_part_of_block, CsStatus, ReadDataHeader, ReadRequestFrame};

/// Worker-pool elasticity thresholds.
pub const MAX_WORKERS: usize = 250;
pub const SUSTAIN_WORKERS: usize = 50;
pub const HEAVYLOAD_WORKERS: usize = 150;
/// Per-inode concurrency cap on enqueued requests.
pub const MAXREQINQUEUE: usize = 16;
/// Per-connection inactivity timeout between received bytes.
const CHUNKSERVER_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);
/// Shorter inactivity timeout used once the pool is above
/// [`HEAVYLOAD_WORKERS`] concurrent workers: give up on a stalled server
/// sooner instead of letting stragglers hold a worker slot while the pool
/// is under pressure.
const CHUNKSERVER_ACTIVITY_TIMEOUT_HEAVYLOAD: Duration = Duration::from_secs(1);
/// `rreq`s older than this and disjoint from the current read are dropped
/// from the live list instead of being reused.
const REQUEST_VALIDITY_TIMEOUT: Duration = Duration::from_secs(60);
/// Threshold past which disjoint requests are marked `NOTNEEDED` eagerly.
const LIVE_REQUEST_SWEEP_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReqState {
    New,
    InQueue,
    Busy,
    Filled,
    Ready,
    Refresh,
    Break,
    NotNeeded,
}

struct ReadRequest {
    offset: u64,
    leng: u32,
    rleng: u32,
    chunk_index: u32,
    state: ReqState,
    try_count: u32,
    modified: Instant,
    lcnt: u32,
    data: Option<Bytes>,
}

impl ReadRequest {
    fn new(offset: u64, leng: u32) -> Self {
        Self {
            offset,
            leng,
            rleng: 0,
            chunk_index: chunk_index_of(offset),
            state: ReqState::New,
            try_count: 0,
            modified: Instant::now(),
            lcnt: 1,
            data: None,
        }
    }

    fn covers(&self, offset: u64, leng: u32) -> bool {
        offset >= self.offset && offset + leng as u64 <= self.offset + self.leng as u64
    }

    fn disjoint_from(&self, first: u64, last: u64) -> bool {
        self.offset + self.leng as u64 <= first || self.offset >= last
    }

    fn reusable(&self) -> bool {
        matches!(self.state, ReqState::Filled | ReqState::Ready | ReqState::Busy | ReqState::InQueue | ReqState::New)
    }
}

struct Slot {
    req: parking_lot::Mutex<ReadRequest>,
    ready: Notify,
}

struct InodeReadState {
    fleng_hint: u64,
    readahead: u8,
    seqdata: u64,
    last_offset: Option<u64>,
    status: Option<EngineError>,
    requests: Vec<Arc<Slot>>,
}

impl InodeReadState {
    fn new(fleng: u64) -> Self {
        Self {
            fleng_hint: fleng,
            readahead: 0,
            seqdata: 0,
            last_offset: None,
            status: None,
            requests: Vec::new(),
        }
    }

    /// Read-ahead controller: widen the prefetch window on sequential
    /// access, reset it otherwise.
    fn update_readahead(&mut self, offset: u64, config: &EngineConfig) {
        let sequential = self.last_offset == Some(offset);
        if sequential {
            if offset == 0 {
                self.readahead = 1;
            } else {
                self.seqdata += config.readahead_leng();
                if self.seqdata >= config.readahead_trigger() {
                    self.readahead = (self.readahead + 1).min(4);
                    self.seqdata = 0;
                }
            }
        } else if let Some(last) = self.last_offset {
            let distance = offset.abs_diff(last);
            if distance > config.readahead_leng() / 2 {
                self.readahead = self.readahead.saturating_sub(1);
                self.seqdata = 0;
            }
        }
    }

    fn sweep_not_needed(&mut self, first: u64, last: u64) {
        let live_count = self
            .requests
            .iter()
            .filter(|s| !matches!(s.req.lock().state, ReqState::Break | ReqState::NotNeeded))
            .count();
        for slot in &self.requests {
            let mut req = slot.req.lock();
            if matches!(req.state, ReqState::Break | ReqState::NotNeeded) {
                continue;
            }
            let stale = req.modified.elapsed() > REQUEST_VALIDITY_TIMEOUT;
            let disjoint = req.disjoint_from(first, last);
            if disjoint && (live_count >= LIVE_REQUEST_SWEEP_THRESHOLD || stale || !req.reusable()) {
                req.state = ReqState::NotNeeded;
            }
        }
        self.requests.retain(|s| !matches!(s.req.lock().state, ReqState::NotNeeded) || s.req.lock().lcnt > 0);
    }
}

/// Opaque per-inode read handle, released via [`ReadEngine::close`].
#[derive(Debug, Clone, Copy)]
pub struct ReadHandle {
    pub inode: u64,
}

/// Token returned from [`ReadEngine::read`]; pass to [`ReadEngine::free_buffers`]
/// once the caller is done with the returned byte slices.
pub struct ReadToken {
    inode: u64,
    slots: Vec<Arc<Slot>>,
}

pub struct ReadEngine {
    master: Arc<dyn MasterClient>,
    conn_pool: Arc<dyn ConnPool>,
    chunk_lock: Arc<ChunkLock>,
    loc_cache: Arc<ChunkLocCache>,
    cs_order: Arc<CSServerOrder>,
    inode_length: Arc<InodeLengthRegistry>,
    config: EngineConfig,
    inodes: parking_lot::Mutex<HashMap<u64, Arc<parking_lot::Mutex<InodeReadState>>>>,
    worker_permits: Arc<Semaphore>,
    active_workers: Arc<AtomicUsize>,
}

impl ReadEngine {
    pub fn new(
        master: Arc<dyn MasterClient>,
        conn_pool: Arc<dyn ConnPool>,
        chunk_lock: Arc<ChunkLock>,
        loc_cache: Arc<ChunkLocCache>,
        cs_order: Arc<CSServerOrder>,
        inode_length: Arc<InodeLengthRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            master,
            conn_pool,
            chunk_lock,
            loc_cache,
            cs_order,
            inode_length,
            config,
            inodes: parking_lot::Mutex::new(HashMap::new()),
            worker_permits: Arc::new(Semaphore::new(MAX_WORKERS)),
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn open(&self, inode: u64, fleng: u64) -> ReadHandle {
        self.inode_length.open(inode, fleng);
        self.inodes
            .lock()
            .entry(inode)
            .or_insert_with(|| Arc::new(parking_lot::Mutex::new(InodeReadState::new(fleng))));
        ReadHandle { inode }
    }

    pub fn close(&self, handle: ReadHandle) {
        self.inodes.lock().remove(&handle.inode);
        self.inode_length.close(handle.inode);
    }

    /// Mark buffers overlapping `[offset, offset + leng)` for refresh.
    /// Also the [`LengthChangeObserver`] hook invoked by `InodeLengthRegistry`.
    pub fn invalidate(&self, inode: u64, offset: u64, leng: u64) {
        let Some(entry) = self.inodes.lock().get(&inode).cloned() else {
            return;
        };
        let state = entry.lock();
        let last = offset.saturating_add(leng);
        for slot in &state.requests {
            let mut req = slot.req.lock();
            if !req.disjoint_from(offset, last) && matches!(req.state, ReqState::Filled | ReqState::Ready) {
                req.state = ReqState::Refresh;
            }
        }
    }

    fn inode_entry(&self, inode: u64) -> Arc<parking_lot::Mutex<InodeReadState>> {
        self.inodes
            .lock()
            .entry(inode)
            .or_insert_with(|| Arc::new(parking_lot::Mutex::new(InodeReadState::new(0))))
            .clone()
    }

    /// `read(handle, offset, size) -> (iovec_list, token)`.
    pub async fn read(&self, handle: ReadHandle, offset: u64, size: u32) -> Result<(Vec<Bytes>, ReadToken), EngineError> {
        if offset >= MAX_FILE_SIZE || offset + size as u64 >= MAX_FILE_SIZE {
            return Err(EngineError::TooBig);
        }

        let fleng = self.inode_length.length(handle.inode).unwrap_or(0);
        if offset >= fleng {
            return Ok((vec![], ReadToken { inode: handle.inode, slots: vec![] }));
        }
        let size = size.min((fleng - offset) as u32);
        if size == 0 {
            return Ok((vec![], ReadToken { inode: handle.inode, slots: vec![] }));
        }

        let first = offset;
        let last = offset + size as u64;

        let entry = self.inode_entry(handle.inode);
        let (slots, prefetch_slots) = {
            let mut state = entry.lock();
            if let Some(status) = state.status {
                return Err(status);
            }
            state.update_readahead(offset, &self.config);
            state.last_offset = Some(offset);
            state.sweep_not_needed(first, last);
            self.plan(&mut state, handle.inode, first, last)
        };

        self.inode_length.enter_reader(handle.inode);
        for slot in &slots {
            self.dispatch(handle.inode, slot.clone()).await;
        }
        // Speculative read-ahead requests: dispatched but never waited on by
        // this call, so they fill the cache for a future sequential read
        // without delaying the caller.
        for slot in prefetch_slots {
            self.dispatch(handle.inode, slot).await;
        }

        for slot in &slots {
            loop {
                let notified = slot.ready.notified();
                {
                    let req = slot.req.lock();
                    if matches!(req.state, ReqState::Ready | ReqState::NotNeeded | ReqState::Break) {
                        break;
                    }
                }
                notified.await;
            }
        }
        self.inode_length.exit_reader(handle.inode);

        let mut out = Vec::with_capacity(slots.len());
        let mut inode_error = None;
        for slot in &slots {
            let req = slot.req.lock();
            match req.state {
                ReqState::Break => inode_error = Some(EngineError::Io),
                _ => {
                    if let Some(data) = &req.data {
                        out.push(clip_to_range(data, req.offset, first, last));
                    }
                }
            }
        }
        if let Some(err) = inode_error {
            entry.lock().status = Some(err);
            return Err(err);
        }

        Ok((out, ReadToken { inode: handle.inode, slots }))
    }

    pub fn free_buffers(&self, token: ReadToken) {
        let Some(entry) = self.inodes.lock().get(&token.inode).cloned() else {
            return;
        };
        let mut state = entry.lock();
        for slot in &token.slots {
            let mut req = slot.req.lock();
            req.lcnt = req.lcnt.saturating_sub(1);
        }
        state.requests.retain(|s| s.req.lock().lcnt > 0 || matches!(s.req.lock().state, ReqState::Ready | ReqState::Filled));
    }

    fn find_reusable(state: &InodeReadState, pos: u64, sub_leng: u32) -> Option<Arc<Slot>> {
        state
            .requests
            .iter()
            .find(|s| {
                let req = s.req.lock();
                req.reusable() && req.covers(pos, sub_leng)
            })
            .cloned()
    }

    fn create_slot(state: &mut InodeReadState, pos: u64, sub_leng: u32) -> Arc<Slot> {
        let req = ReadRequest::new(pos, sub_leng);
        let slot = Arc::new(Slot {
            req: parking_lot::Mutex::new(req),
            ready: Notify::new(),
        });
        state.requests.push(slot.clone());
        slot
    }

    /// Request planning, simplified: split the target range at
    /// existing-request boundaries and chunk boundaries, reusing coverage
    /// where possible. Also plans speculative read-ahead requests beyond
    /// `last` when `state.readahead` calls for it (see
    /// [`InodeReadState::update_readahead`]), returned separately so the
    /// caller dispatches but never waits on them.
    fn plan(&self, state: &mut InodeReadState, _inode: u64, first: u64, last: u64) -> (Vec<Arc<Slot>>, Vec<Arc<Slot>>) {
        let mut out = Vec::new();
        let mut pos = first;
        while pos < last {
            let chunk_index = chunk_index_of(pos);
            let chunk_end = chunk_start_offset(chunk_index + 1);
            let sub_end = last.min(chunk_end);
            let sub_leng = (sub_end - pos) as u32;

            if let Some(slot) = Self::find_reusable(state, pos, sub_leng) {
                slot.req.lock().lcnt += 1;
                out.push(slot);
            } else {
                out.push(Self::create_slot(state, pos, sub_leng));
            }
            pos = sub_end;
        }

        let mut prefetch = Vec::new();
        if state.readahead > 0 {
            let prefetch_span = (state.readahead as u64) * self.config.readahead_leng();
            let prefetch_last = last.saturating_add(prefetch_span).min(state.fleng_hint);
            let mut pos = last;
            while pos < prefetch_last {
                let chunk_index = chunk_index_of(pos);
                let chunk_end = chunk_start_offset(chunk_index + 1);
                let sub_end = prefetch_last.min(chunk_end);
                let sub_leng = (sub_end - pos) as u32;

                if let Some(slot) = Self::find_reusable(state, pos, sub_leng) {
                    prefetch.push(slot);
                } else if state.requests.len() < MAXREQINQUEUE {
                    prefetch.push(Self::create_slot(state, pos, sub_leng));
                } else {
                    // Per-inode queue is at capacity; stop issuing further
                    // speculative requests rather than evicting live coverage.
                    break;
                }
                pos = sub_end;
            }
        }

        (out, prefetch)
    }

    async fn dispatch(&self, inode: u64, slot: Arc<Slot>) {
        {
            let mut req = slot.req.lock();
            if !matches!(req.state, ReqState::New | ReqState::Refresh) {
                return;
            }
            req.state = ReqState::InQueue;
        }

        let master = self.master.clone();
        let conn_pool = self.conn_pool.clone();
        let chunk_lock = self.chunk_lock.clone();
        let loc_cache = self.loc_cache.clone();
        let cs_order = self.cs_order.clone();
        let config = self.config.clone();
        let permits = self.worker_permits.clone();
        let active_workers = self.active_workers.clone();

        tokio::spawn(async move {
            let _permit = permits.acquire().await;
            let active = active_workers.fetch_add(1, Ordering::Relaxed) + 1;
            if active == SUSTAIN_WORKERS + 1 {
                log::debug!("read worker pool above sustain level ({active} workers)");
            } else if active == HEAVYLOAD_WORKERS + 1 {
                log::warn!("read worker pool above heavy-load level ({active} workers)");
            }
            let heavy_load = active > HEAVYLOAD_WORKERS;
            {
                slot.req.lock().state = ReqState::Busy;
            }
            let outcome = run_worker(&master, &conn_pool, &chunk_lock, &loc_cache, &cs_order, &config, inode, &slot, heavy_load).await;
            active_workers.fetch_sub(1, Ordering::Relaxed);
            let mut req = slot.req.lock();
            req.modified = Instant::now();
            req.state = outcome;
            drop(req);
            slot.ready.notify_waiters();
        });
    }
}

impl LengthChangeObserver for ReadEngine {
    fn invalidate_range(&self, inode: u64, offset: u64, leng: u64) {
        self.invalidate(inode, offset, leng);
    }
}

fn clip_to_range(data: &Bytes, req_offset: u64, first: u64, last: u64) -> Bytes {
    let start = first.max(req_offset) - req_offset;
    let end = (last.min(req_offset + data.len() as u64) - req_offset).max(start);
    data.slice(start as usize..end as usize)
}

/// Worker algorithm for one `rreq`. Runs to
/// completion inside one attempt; retry/backoff looping happens here since
/// each call owns the request's full lifecycle until terminal.
async fn run_worker(
    master: &Arc<dyn MasterClient>,
    conn_pool: &Arc<dyn ConnPool>,
    chunk_lock: &Arc<ChunkLock>,
    loc_cache: &Arc<ChunkLocCache>,
    cs_order: &Arc<CSServerOrder>,
    config: &EngineConfig,
    inode: u64,
    slot: &Arc<Slot>,
    heavy_load: bool,
) -> ReqState {
    let (chunk_index, req_offset, req_leng) = {
        let req = slot.req.lock();
        (req.chunk_index, req.offset, req.leng)
    };

    // Held for the whole attempt (resolution through chunk-server I/O) —
    // excludes a concurrent `writeend` from publishing a new version
    // mid-read.
    let _read_guard = chunk_lock.read_lock(inode, chunk_index).await;

    let cache_eligible = master.capabilities().chunk_loc_cache_eligible;

    let mut master_attempt = 0u32;
    let location = loop {
        if cache_eligible {
            if let Some((id, ver, chain)) = loc_cache.find(inode, chunk_index) {
                break Ok((id, ver, chain));
            }
        }
        match master.read_chunk(inode, chunk_index).await {
            Ok(loc) => {
                if cache_eligible {
                    loc_cache.insert(inode, chunk_index, loc.chunk_id, loc.version, loc.chain.clone());
                }
                break Ok((loc.chunk_id, loc.version, loc.chain));
            }
            Err(status) => match crate::master::classify(status, config.error_on_lost_chunk(), config.error_on_no_space()) {
                MasterOutcome::Retry(RetryableError::NotDone) => unreachable!("master path never yields NotDone"),
                MasterOutcome::Retry(_) => {
                    tokio::time::sleep(master_retry_delay(master_attempt)).await;
                    master_attempt += 1;
                    if master_attempt > config.io_try_cnt() {
                        break Err(EngineError::Io);
                    }
                    continue;
                }
                MasterOutcome::Fail(err) => break Err(err),
            },
        }
    };

    let (chunk_id, version, chain) = match location {
        Ok(v) => v,
        Err(_) => return ReqState::Break,
    };

    if chunk_id.is_hole() {
        let mut req = slot.req.lock();
        req.rleng = req.leng;
        req.data = Some(Bytes::from(vec![0u8; req.leng as usize]));
        req.state = ReqState::Filled;
        return ReqState::Ready;
    }

    if !chain.is_well_formed() {
        loc_cache.invalidate(inode, chunk_index);
        return ReqState::Refresh;
    }

    let chunk_base = chunk_start_offset(chunk_index);
    let buffer = match read_chunk_range(conn_pool, cs_order, config, chunk_id, version, &chain, chunk_base, req_offset, req_leng, heavy_load).await {
        Ok(buf) => buf,
        Err(_) => {
            loc_cache.invalidate(inode, chunk_index);
            let mut req = slot.req.lock();
            req.try_count += 1;
            if req.try_count > config.io_try_cnt() {
                return ReqState::Break;
            }
            drop(req);
            tokio::time::sleep(chunk_server_retry_delay(slot.req.lock().try_count)).await;
            return ReqState::Refresh;
        }
    };

    if cache_eligible && !loc_cache.check(inode, chunk_index, chunk_id, version) {
        return ReqState::Refresh;
    }

    let mut req = slot.req.lock();
    req.rleng = buffer.len() as u32;
    req.data = Some(buffer.freeze());
    req.state = ReqState::Filled;
    ReqState::Ready
}

async fn read_chunk_range(
    conn_pool: &Arc<dyn ConnPool>,
    cs_order: &Arc<CSServerOrder>,
    config: &EngineConfig,
    chunk_id: ChunkId,
    version: ChunkVersion,
    chain: &CsChain,
    chunk_base: u64,
    req_offset: u64,
    req_leng: u32,
    heavy_load: bool,
) -> Result<BytesMut, anyhow::Error> {
    let part_count = chain.part_count();
    let mut out = BytesMut::zeroed(req_leng as usize);

    match chain {
        CsChain::Plain(servers) => {
            let mut servers = servers.clone();
            cs_order.sort(&mut servers, false);
            let in_chunk_offset = (req_offset - chunk_base) as u32;
            let data = read_from_chain(conn_pool, cs_order, &servers, config, chunk_id.0, version.0, in_chunk_offset, req_leng, heavy_load).await?;
            out.copy_from_slice(&data);
        }
        CsChain::Split(parts) => {
            let first_block = block_index_of(req_offset);
            let block_count = (req_leng + BLOCK_SIZE - 1) / BLOCK_SIZE;
            for i in 0..=block_count {
                let block_index = first_block as u32 + i;
                if (block_index as u64) * (BLOCK_SIZE as u64) >= req_leng as u64 + (req_offset - chunk_base) {
                    break;
                }
                let (part, part_block) = split_part_of_block(block_index, part_count);
                if part >= parts.len() {
                    continue;
                }
                let mut servers = parts[part].clone();
                cs_order.sort(&mut servers, false);
                let part_chunk_id = wire::split_chunk_id(chunk_id, part_count, part);
                let part_offset = part_block * BLOCK_SIZE;
                let logical_block_start = chunk_base + (logical_block_of_split(part, part_block, part_count) as u64) * BLOCK_SIZE as u64;
                let copy_start = logical_block_start.max(req_offset);
                let copy_end = (logical_block_start + BLOCK_SIZE as u64).min(req_offset + req_leng as u64);
                if copy_end <= copy_start {
                    continue;
                }
                let want_leng = BLOCK_SIZE;
                let data = read_from_chain(conn_pool, cs_order, &servers, config, part_chunk_id, version.0, part_offset, want_leng, heavy_load).await?;
                let src_start = (copy_start - logical_block_start) as usize;
                let src_end = (copy_end - logical_block_start) as usize;
                let dst_start = (copy_start - req_offset) as usize;
                let dst_end = (copy_end - req_offset) as usize;
                out[dst_start..dst_end].copy_from_slice(&data[src_start..src_end]);
            }
        }
    }

    Ok(out)
}

/// Try each server in `servers` (already ranked) until one satisfies the
/// read, collapsed into a single-part fetch.
async fn read_from_chain(
    conn_pool: &Arc<dyn ConnPool>,
    cs_order: &Arc<CSServerOrder>,
    servers: &[ServerDescriptor],
    config: &EngineConfig,
    chunk_id: u64,
    version: u32,
    in_chunk_offset: u32,
    leng: u32,
    heavy_load: bool,
) -> Result<Bytes, anyhow::Error> {
    let mut last_err = anyhow::anyhow!("no chunk servers available");
    for server in servers {
        cs_order.load_table().read_inc(server.ip, server.port);
        let result = read_from_server(conn_pool, server, config, chunk_id, version, in_chunk_offset, leng, heavy_load).await;
        cs_order.load_table().read_dec(server.ip, server.port);
        match result {
            Ok(data) => return Ok(data),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

async fn read_from_server(
    conn_pool: &Arc<dyn ConnPool>,
    server: &ServerDescriptor,
    _config: &EngineConfig,
    chunk_id: u64,
    version: u32,
    in_chunk_offset: u32,
    leng: u32,
    heavy_load: bool,
) -> Result<Bytes, anyhow::Error> {
    let activity_timeout = if heavy_load {
        CHUNKSERVER_ACTIVITY_TIMEOUT_HEAVYLOAD
    } else {
        CHUNKSERVER_ACTIVITY_TIMEOUT
    };
    let mut stream = match conn_pool.get(server.ip, server.port).await {
        Some(pooled) => pooled,
        None => {
            let mut attempt = 0;
            loop {
                match transport::dial(server.ip, server.port).await {
                    Ok(stream) => break TcpPooledSocket(stream),
                    Err(err) => {
                        attempt += 1;
                        if attempt >= MAX_CONNECT_ATTEMPTS {
                            return Err(err);
                        }
                        tokio::time::sleep(connect_retry_delay(attempt)).await;
                    }
                }
            }
        }
    };

    let new_framing = server.version >= 1;
    let frame = ReadRequestFrame {
        chunk_id,
        version,
        offset: in_chunk_offset,
        size: leng,
        new_framing,
    };
    transport::write_frame(stream.stream(), &frame.encode()).await?;

    let mut out = BytesMut::zeroed(leng as usize);
    let mut got_data = false;
    let mut got_status = false;
    while !(got_data && got_status) {
        let header = tokio::time::timeout(activity_timeout, transport::read_header(stream.stream())).await??;
        match header.cmd {
            cmd::ANTOAN_NOP => continue,
            cmd::CSTOCL_READ_DATA => {
                let body = tokio::time::timeout(activity_timeout, transport::read_body(stream.stream(), header.leng)).await??;
                anyhow::ensure!(body.len() >= ReadDataHeader::LEN, "short read-data frame");
                let data_header = ReadDataHeader::decode(&body)?;
                let payload = &body[ReadDataHeader::LEN..];
                anyhow::ensure!(payload.len() as u32 == data_header.size, "read-data length mismatch");
                anyhow::ensure!(wire::verify_crc(&data_header, payload), "read-data crc mismatch");
                let start = data_header.offset_in_block as usize;
                let end = start + payload.len();
                anyhow::ensure!(end <= out.len(), "read-data exceeds requested range");
                out[start..end].copy_from_slice(payload);
                got_data = true;
            }
            cmd::CSTOCL_READ_STATUS => {
                let body = tokio::time::timeout(activity_timeout, transport::read_body(stream.stream(), header.leng)).await??;
                let status_frame = wire::ReadStatusFrame::decode(&body)?;
                match status_frame.status {
                    CsStatus::Ok => got_status = true,
                    CsStatus::NotDone => {
                        tokio::time::sleep(NOT_DONE_RETRY_DELAY).await;
                        continue;
                    }
                    CsStatus::Error(code) => anyhow::bail!("chunk server returned error status {code}"),
                }
            }
            other => anyhow::bail!("unexpected chunk-server command {other}"),
        }
    }

    conn_pool.insert(server.ip, server.port, stream).await;
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_covers_and_disjoint() {
        let req = ReadRequest::new(100, 50);
        assert!(req.covers(100, 50));
        assert!(req.covers(110, 10));
        assert!(!req.covers(140, 20));
        assert!(req.disjoint_from(200, 300));
        assert!(!req.disjoint_from(120, 130));
    }

    #[test]
    fn readahead_increments_on_sequential_traffic() {
        let mut state = InodeReadState::new(0);
        let config = EngineConfig::default();
        state.update_readahead(0, &config);
        assert_eq!(state.readahead, 1);
        state.last_offset = Some(0);
        state.update_readahead(0, &config);
    }

    #[test]
    fn readahead_decrements_on_non_sequential_jump() {
        let mut state = InodeReadState::new(0);
        let config = EngineConfig::default();
        state.readahead = 2;
        state.last_offset = Some(0);
        state.update_readahead(100 * 1024 * 1024, &config);
        assert_eq!(state.readahead, 1);
    }
}
