//! End-to-end coverage: a write committed through the pipelined chain
//! worker becomes visible to a fresh read, including a write that spans
//! more than one block. Runs against the fake chunk server and fake
//! master in `cfs_client::testing` rather than a real cluster.

use std::sync::Arc;

use bytes::Bytes;
use cfs_api_types::{EngineConfig, ServerDescriptor};
use cfs_client::testing::{spawn_fake_chunk_server, FakeMasterClient};
use cfs_client::{
    ChunkLocCache, ChunkLock, CSServerOrder, InMemoryConnPool, InodeLengthRegistry, ReadEngine, WriteEngine,
};

struct Harness {
    read: Arc<ReadEngine>,
    write: Arc<WriteEngine>,
    master: Arc<FakeMasterClient>,
}

async fn harness() -> Harness {
    harness_with(|server| Arc::new(FakeMasterClient::new(server))).await
}

/// Same fake chunk server, but the master double allocates every chunk in
/// split mode across `part_count` parts (all pointing at the one fake
/// server, since reassembly only cares about which chunk-id each part maps
/// to, not which server).
async fn split_harness(part_count: usize) -> Harness {
    harness_with(move |server| Arc::new(FakeMasterClient::new_split(server, part_count))).await
}

async fn harness_with(make_master: impl FnOnce(ServerDescriptor) -> Arc<FakeMasterClient>) -> Harness {
    let (addr, _server) = spawn_fake_chunk_server().await;
    let server = ServerDescriptor {
        ip: u32::from(match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!("fake chunk server always binds an IPv4 loopback address"),
        }),
        port: addr.port(),
        version: 1,
        label_mask: 0,
        priority: 0,
    };

    let master = make_master(server);
    let conn_pool: Arc<dyn cfs_client::ConnPool> = Arc::new(InMemoryConnPool::new(16));
    let chunk_lock = Arc::new(ChunkLock::new());
    let loc_cache = Arc::new(ChunkLocCache::new(std::time::Duration::from_secs(1)));
    let cs_order = Arc::new(CSServerOrder::new(None));
    let inode_length = Arc::new(InodeLengthRegistry::new());

    let read = ReadEngine::new(
        master.clone(),
        conn_pool.clone(),
        chunk_lock.clone(),
        loc_cache.clone(),
        cs_order.clone(),
        inode_length.clone(),
        EngineConfig::default(),
    );
    let read = Arc::new(read);
    let write = Arc::new(WriteEngine::new(
        master.clone(),
        conn_pool,
        chunk_lock,
        loc_cache,
        cs_order,
        inode_length,
        read.clone() as Arc<dyn cfs_client::LengthChangeObserver>,
        EngineConfig::default(),
    ));

    Harness { read, write, master }
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let h = harness().await;
    let write_handle = h.write.open(42, 0);
    h.write
        .write(write_handle, 0, Bytes::from_static(b"hello chunk server"), false)
        .await
        .expect("write");
    h.write.flush(write_handle).await.expect("flush");

    let new_len = h.master.max_fleng(42);
    assert_eq!(new_len, b"hello chunk server".len() as u64);

    let read_handle = h.read.open(42, new_len);
    let (iov, token) = h.read.read(read_handle, 0, new_len as u32).await.expect("read");
    let got: Vec<u8> = iov.iter().flat_map(|b| b.to_vec()).collect();
    assert_eq!(got, b"hello chunk server");
    h.read.free_buffers(token);
}

#[tokio::test]
async fn split_mode_write_reassembles_across_four_parts() {
    let h = split_harness(4).await;
    let handle = h.write.open(99, 0);

    // Cover enough logical blocks that the round-robin part striping in
    // `wire::split_part_of_block` actually spreads data across every part,
    // not just part 0.
    let block = cfs_api_types::BLOCK_SIZE as usize;
    let mut payload = Vec::with_capacity(block * 6);
    for i in 0..6u8 {
        payload.extend(std::iter::repeat(b'a' + i).take(block));
    }
    h.write.write(handle, 0, Bytes::from(payload.clone()), false).await.expect("split write");
    h.write.flush(handle).await.expect("flush");

    let fleng = h.master.max_fleng(99);
    assert_eq!(fleng, payload.len() as u64);

    let read_handle = h.read.open(99, fleng);
    let (iov, token) = h.read.read(read_handle, 0, fleng as u32).await.expect("split read");
    let got: Vec<u8> = iov.iter().flat_map(|b| b.to_vec()).collect();
    assert_eq!(got, payload);
    h.read.free_buffers(token);
}

#[tokio::test]
async fn write_past_first_block_spans_two_blocks() {
    let h = harness().await;
    let handle = h.write.open(7, 0);
    let first = vec![b'a'; cfs_api_types::BLOCK_SIZE as usize];
    let second = vec![b'b'; 100];
    h.write.write(handle, 0, Bytes::from(first.clone()), false).await.expect("write first block");
    h.write
        .write(handle, cfs_api_types::BLOCK_SIZE as u64, Bytes::from(second.clone()), false)
        .await
        .expect("write second block");
    h.write.flush(handle).await.expect("flush");

    let fleng = h.master.max_fleng(7);
    assert_eq!(fleng, cfs_api_types::BLOCK_SIZE as u64 + second.len() as u64);

    let read_handle = h.read.open(7, fleng);
    let (iov, token) = h.read.read(read_handle, 0, fleng as u32).await.expect("read back");
    let got: Vec<u8> = iov.iter().flat_map(|b| b.to_vec()).collect();
    assert_eq!(&got[..first.len()], &first[..]);
    assert_eq!(&got[first.len()..], &second[..]);
    h.read.free_buffers(token);
}
