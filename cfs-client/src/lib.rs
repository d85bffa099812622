//! The concurrent chunk I/O engine: read-ahead, write-back coalescing,
//! chunk locking, chunk location caching and the chunk-server ordering
//! policy that sits above them.
//!
//! This crate is transport- and session-agnostic: it depends on the
//! [`master::MasterClient`] and [`conn_pool::ConnPool`] traits rather than
//! any concrete master-session or connection-pool implementation, so a
//! façade crate can supply those without this crate knowing about
//! reconnection, authentication or keep-alives.

pub mod chunk_loc_cache;
pub mod chunk_lock;
pub mod conn_pool;
pub mod cs_order;
pub mod inode_length;
pub mod master;
pub mod read_engine;
pub mod retry;
pub mod transport;
pub mod wire;
pub mod write_engine;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chunk_loc_cache::ChunkLocCache;
pub use chunk_lock::{ChunkLock, ChunkReadGuard, ChunkWriteGuard};
pub use conn_pool::{ConnPool, InMemoryConnPool, TcpPooledSocket};
pub use cs_order::{CsLoadTable, CSServerOrder, LabelExpr};
pub use inode_length::{InodeLengthRegistry, LengthChangeObserver};
pub use master::{ChunkLocation, MasterCapabilities, MasterClient, MasterOpFlags, MasterOutcome, StatFs};
pub use read_engine::{ReadEngine, ReadHandle};
pub use write_engine::{WriteEngine, WriteHandle};
