//! Writer-preference fairness under concurrency, driven the way the
//! read/write engines actually use `ChunkLock` (one entry per
//! `(inode, chunk_index)`, reader guards held across an await point).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cfs_client::ChunkLock;

#[tokio::test]
async fn waiting_writer_is_served_before_a_reader_that_arrives_after_it() {
    let lock = Arc::new(ChunkLock::new());
    let first_reader = lock.read_lock(1, 0).await;

    let writer_order = Arc::new(AtomicBool::new(false));
    let reader_order = Arc::new(AtomicBool::new(false));

    let writer_lock = lock.clone();
    let writer_flag = writer_order.clone();
    let writer = tokio::spawn(async move {
        let _g = writer_lock.write_lock(1, 0).await;
        writer_flag.store(true, Ordering::SeqCst);
    });

    // Let the writer register as waiting before the late reader shows up.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let reader_lock = lock.clone();
    let reader_flag = reader_order.clone();
    let late_reader = tokio::spawn(async move {
        let _g = reader_lock.read_lock(1, 0).await;
        reader_flag.store(true, Ordering::SeqCst);
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!writer_order.load(Ordering::SeqCst), "writer must not proceed while the first reader holds the lock");
    assert!(!reader_order.load(Ordering::SeqCst), "late reader must not jump ahead of the waiting writer");

    drop(first_reader);
    writer.await.unwrap();
    late_reader.await.unwrap();

    assert!(writer_order.load(Ordering::SeqCst));
    assert!(reader_order.load(Ordering::SeqCst));
}

#[tokio::test]
async fn independent_chunks_do_not_contend() {
    let lock = Arc::new(ChunkLock::new());
    let writer_a = lock.write_lock(1, 0).await;
    // A writer on a different chunk index of the same inode must not block.
    let reader_b = lock.read_lock(1, 1).await;
    drop(writer_a);
    drop(reader_b);
    assert_eq!(lock.live_entries(), 0);
}
