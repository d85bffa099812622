//! Test-only doubles for [`MasterClient`] and a fake chunk server, so the
//! read/write engines can be exercised end to end over real loopback TCP
//! without a live master or chunk-server cluster. Grounded on the wire
//! shapes in [`crate::wire`] and the trait contracts in
//! [`crate::master`]/[`crate::conn_pool`].

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use cfs_api_types::{ChunkId, ChunkVersion, CsChain, MasterStatus, ServerDescriptor};

use crate::master::{ChunkLocation, MasterCapabilities, MasterClient, MasterOpFlags, StatFs};
use crate::wire::{cmd, CsStatus, FrameHeader, ReadDataHeader, WriteStatusFrame, HEADER_LEN};

struct FakeMasterState {
    locations: HashMap<(u64, u32), ChunkLocation>,
    max_fleng: HashMap<u64, u64>,
    next_chunk_id: u64,
}

/// In-memory [`MasterClient`]: every `(inode, chunk_index)` that hasn't been
/// written yet is allocated a fresh chunk id pointing at a single fixed
/// server chain, mirroring a one-chunk-server test cluster.
pub struct FakeMasterClient {
    state: parking_lot::Mutex<FakeMasterState>,
    chain: CsChain,
    capabilities: MasterCapabilities,
}

impl FakeMasterClient {
    pub fn new(server: ServerDescriptor) -> Self {
        Self::with_chain(CsChain::Plain(vec![server]))
    }

    /// A master double whose every chunk is allocated in split mode, each
    /// part pointing at the same fake chunk server (sufficient to exercise
    /// the engines' split-mode fan-out/reassembly without a per-part
    /// cluster).
    pub fn new_split(server: ServerDescriptor, part_count: usize) -> Self {
        let parts = (0..part_count).map(|_| vec![server]).collect();
        Self::with_chain(CsChain::Split(parts))
    }

    fn with_chain(chain: CsChain) -> Self {
        Self {
            state: parking_lot::Mutex::new(FakeMasterState {
                locations: HashMap::new(),
                max_fleng: HashMap::new(),
                next_chunk_id: 1,
            }),
            chain,
            capabilities: MasterCapabilities {
                chunk_loc_cache_eligible: true,
                atomic_append: false,
            },
        }
    }

    pub fn max_fleng(&self, inode: u64) -> u64 {
        *self.state.lock().max_fleng.get(&inode).unwrap_or(&0)
    }
}

#[async_trait]
impl MasterClient for FakeMasterClient {
    fn capabilities(&self) -> MasterCapabilities {
        self.capabilities
    }

    async fn read_chunk(&self, inode: u64, chunk_index: u32) -> Result<ChunkLocation, MasterStatus> {
        let state = self.state.lock();
        match state.locations.get(&(inode, chunk_index)) {
            Some(loc) => Ok(loc.clone()),
            None => Err(MasterStatus::NoChunk),
        }
    }

    async fn write_chunk(&self, inode: u64, chunk_index: u32, _flags: MasterOpFlags) -> Result<ChunkLocation, MasterStatus> {
        let mut state = self.state.lock();
        if let Some(loc) = state.locations.get(&(inode, chunk_index)) {
            return Ok(loc.clone());
        }
        let chunk_id = ChunkId(state.next_chunk_id);
        state.next_chunk_id += 1;
        let loc = ChunkLocation {
            chunk_id,
            version: ChunkVersion(1),
            chain: self.chain.clone(),
        };
        state.locations.insert((inode, chunk_index), loc.clone());
        Ok(loc)
    }

    async fn write_chunk_end(
        &self,
        inode: u64,
        _chunk_index: u32,
        _chunk_id: ChunkId,
        _version: ChunkVersion,
        max_fleng: u64,
        _flags: MasterOpFlags,
    ) -> Result<(), MasterStatus> {
        let mut state = self.state.lock();
        let entry = state.max_fleng.entry(inode).or_insert(0);
        *entry = (*entry).max(max_fleng);
        Ok(())
    }

    async fn truncate(&self, inode: u64, length: u64) -> Result<(), MasterStatus> {
        self.state.lock().max_fleng.insert(inode, length);
        Ok(())
    }

    async fn statfs(&self, _inode: u64) -> Result<StatFs, MasterStatus> {
        Ok(StatFs {
            total_space: 1 << 40,
            avail_space: 1 << 39,
            total_inodes: 1_000_000,
            avail_inodes: 999_999,
        })
    }
}

/// Start a single fake chunk server backed by an in-process byte store,
/// accepting one connection at a time (sufficient for the plain-chain
/// scenarios these engines are tested against). Returns the address to
/// dial and the handle of the accept loop task.
pub async fn spawn_fake_chunk_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind fake chunk server");
    let addr = listener.local_addr().expect("local_addr");
    let handle = tokio::spawn(async move {
        let store: parking_lot::Mutex<HashMap<u64, BytesMut>> = parking_lot::Mutex::new(HashMap::new());
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            if serve_connection(stream, &store).await.is_err() {
                continue;
            }
        }
    });
    (addr, handle)
}

async fn serve_connection(
    mut stream: TcpStream,
    store: &parking_lot::Mutex<HashMap<u64, BytesMut>>,
) -> Result<(), anyhow::Error> {
    loop {
        let mut header_buf = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header_buf).await.is_err() {
            return Ok(());
        }
        let header = FrameHeader::decode(&header_buf)?;
        let mut body = vec![0u8; header.leng as usize];
        stream.read_exact(&mut body).await?;

        match header.cmd {
            cmd::ANTOAN_NOP => continue,
            cmd::CLTOCS_READ => {
                let mut buf = &body[..];
                let has_flags = body.len() == 21;
                if has_flags {
                    buf.advance(1);
                }
                let chunk_id = buf.get_u64();
                let _version = buf.get_u32();
                let offset = buf.get_u32();
                let size = buf.get_u32();

                let payload = {
                    let store = store.lock();
                    let chunk = store.get(&chunk_id);
                    let mut out = vec![0u8; size as usize];
                    if let Some(chunk) = chunk {
                        let start = offset as usize;
                        let end = (start + size as usize).min(chunk.len());
                        if start < end {
                            out[..end - start].copy_from_slice(&chunk[start..end]);
                        }
                    }
                    out
                };

                let data_header = ReadDataHeader {
                    chunk_id,
                    block_num: 0,
                    offset_in_block: 0,
                    size: payload.len() as u32,
                    crc32: crc32fast::hash(&payload),
                };
                let mut data_body = BytesMut::with_capacity(ReadDataHeader::LEN + payload.len());
                data_body.put_u64(data_header.chunk_id);
                data_body.put_u16(data_header.block_num);
                data_body.put_u16(data_header.offset_in_block);
                data_body.put_u32(data_header.size);
                data_body.put_u32(data_header.crc32);
                data_body.put_slice(&payload);
                write_frame(&mut stream, cmd::CSTOCL_READ_DATA, &data_body).await?;

                let mut status_body = BytesMut::with_capacity(9);
                status_body.put_u64(chunk_id);
                status_body.put_u8(CsStatus::Ok.to_byte());
                write_frame(&mut stream, cmd::CSTOCL_READ_STATUS, &status_body).await?;
            }
            cmd::CLTOCS_WRITE => {
                let mut buf = &body[..];
                let chunk_id = buf.get_u64();
                let ack = WriteStatusFrame { chunk_id, writeid: 0, status: CsStatus::Ok };
                write_frame(&mut stream, cmd::CSTOCL_WRITE_STATUS, &ack.encode_body()).await?;
            }
            cmd::CLTOCS_WRITE_DATA => {
                let mut buf = &body[..];
                let chunk_id = buf.get_u64();
                let writeid = buf.get_u32();
                let pos = buf.get_u16();
                let from = buf.get_u16();
                let size = buf.get_u32();
                let _crc = buf.get_u32();
                let data = &buf[..size as usize];

                let block_start = (pos as u64) * (cfs_api_types::BLOCK_SIZE as u64) + from as u64;
                {
                    let mut store = store.lock();
                    let chunk = store.entry(chunk_id).or_insert_with(BytesMut::new);
                    let end = block_start as usize + data.len();
                    if chunk.len() < end {
                        chunk.resize(end, 0);
                    }
                    chunk[block_start as usize..end].copy_from_slice(data);
                }

                let status = WriteStatusFrame { chunk_id, writeid, status: CsStatus::Ok };
                write_frame(&mut stream, cmd::CSTOCL_WRITE_STATUS, &status.encode_body()).await?;
            }
            cmd::CLTOCS_WRITE_FINISH => {
                return Ok(());
            }
            other => anyhow::bail!("fake chunk server got unexpected command {other}"),
        }
    }
}

async fn write_frame(stream: &mut TcpStream, cmd: u32, body: &[u8]) -> Result<(), anyhow::Error> {
    let header = FrameHeader { cmd, leng: body.len() as u32 };
    stream.write_all(&header.encode()).await?;
    stream.write_all(body).await?;
    Ok(())
}

trait WriteStatusBody {
    fn encode_body(&self) -> BytesMut;
}

impl WriteStatusBody for WriteStatusFrame {
    fn encode_body(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(WriteStatusFrame::BODY_LEN);
        body.put_u64(self.chunk_id);
        body.put_u32(self.writeid);
        body.put_u8(self.status.to_byte());
        body
    }
}
