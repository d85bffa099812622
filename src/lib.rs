//! Concurrent chunk I/O engine for a distributed, chunked file system
//! client.
//!
//! This crate is a thin façade over [`cfs_client`]: it re-exports the
//! read/write engines and the supporting contracts (`MasterClient`,
//! `ConnPool`) that a POSIX/FUSE front end would wire up to a real master
//! session and connection pool. That front end, the path/attribute caches
//! above it, and the master daemon itself are out of scope here — this
//! crate only owns chunk-level I/O below the inode/offset boundary.

pub use cfs_api_types::{ChunkId, ChunkVersion, EngineConfig, EngineError};
pub use cfs_client::{
    ChunkLocCache, ChunkLock, ChunkReadGuard, ChunkWriteGuard, ConnPool, CsLoadTable, CSServerOrder,
    InMemoryConnPool, InodeLengthRegistry, LabelExpr, LengthChangeObserver, MasterCapabilities, MasterClient,
    MasterOpFlags, MasterOutcome, ReadEngine, ReadHandle, StatFs, TcpPooledSocket, WriteEngine, WriteHandle,
};
