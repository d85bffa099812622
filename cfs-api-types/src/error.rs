//! Error kinds surfaced by the engine, and the internal retry signals that
//! never escape it.

use thiserror::Error;

/// Errors the engine returns to its caller (the POSIX/FUSE façade, out of
/// scope here). Each variant maps to the errno the façade would translate
/// it to; we keep the Rust-native name rather than the numeric value so
/// call sites read like the condition they handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Chunk-server I/O exhausted its retry budget (`EIO`).
    #[error("I/O error talking to chunk server")]
    Io,

    /// No usable chunk server remained for the chunk (`ENXIO`), either
    /// because the master reported the chunk lost or the chain was empty
    /// after exhausting retries, when `error_on_lost_chunk` is set.
    #[error("no chunk server available for this chunk")]
    NoChunkServer,

    /// Storage exhausted (`ENOSPC`), either the master's allocation refused
    /// for lack of space or a write was rejected mid-chain.
    #[error("no space left on the data store")]
    NoSpace,

    /// Quota exceeded (`EDQUOT`).
    #[error("quota exceeded")]
    QuotaExceeded,

    /// File descriptor refers to an object the master no longer knows
    /// about (`EBADF`), e.g. `ENOENT`/`EPERM`/`NOCHUNK` from the master.
    #[error("stale file handle")]
    BadFileDescriptor,

    /// Offset or size rejected before touching the engine (`EINVAL`), e.g.
    /// `INDEXTOOBIG` from the master, or a locally detected `MAX_FILE_SIZE`
    /// violation surfaced as `TooBig` instead (see below).
    #[error("invalid argument")]
    InvalidArgument,

    /// `offset >= MAX_FILE_SIZE` or `offset + size >= MAX_FILE_SIZE`
    /// (`EFBIG`), rejected before any engine work begins.
    #[error("file too large")]
    TooBig,

    /// The data store (or this chunk) is read-only (`EROFS`).
    #[error("read-only file system")]
    ReadOnlyFilesystem,
}

impl EngineError {
    /// Best-effort mapping to a libc-style errno, for a façade that wants
    /// the numeric value rather than matching on the enum.
    pub fn raw_errno(&self) -> i32 {
        match self {
            EngineError::Io => libc_like::EIO,
            EngineError::NoChunkServer => libc_like::ENXIO,
            EngineError::NoSpace => libc_like::ENOSPC,
            EngineError::QuotaExceeded => libc_like::EDQUOT,
            EngineError::BadFileDescriptor => libc_like::EBADF,
            EngineError::InvalidArgument => libc_like::EINVAL,
            EngineError::TooBig => libc_like::EFBIG,
            EngineError::ReadOnlyFilesystem => libc_like::EROFS,
        }
    }
}

/// A tiny local copy of the handful of errno values we need, so this crate
/// does not have to depend on `libc` just to name constants.
mod libc_like {
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const ENOSPC: i32 = 28;
    pub const EROFS: i32 = 30;
    pub const EFBIG: i32 = 27;
    pub const EINVAL: i32 = 22;
    pub const ENXIO: i32 = 6;
    pub const EDQUOT: i32 = 122;
}

/// Conditions that are always retried internally and must never reach the
/// engine's public API directly: transient master errors and the
/// chunk-lost / no-chunkservers case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableError {
    /// Master reports the inode/chunk is locked by a concurrent operation.
    Locked,
    /// Master asks the caller to retry shortly (`EAGAIN`).
    Eagain,
    /// Chunk-server reports a write in flight on the server has not
    /// finished yet. Retried with a fixed delay *without* incrementing
    /// `try_count`.
    NotDone,
}

/// Status the master can return for a `READ_CHUNK`/`WRITE_CHUNK`/
/// `WRITE_CHUNK_END` RPC; used by [`crate::EngineConfig`]-aware callers to
/// decide retry vs. terminal mapping. Contract only: `cfs-client::master`
/// owns the actual mapping logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterStatus {
    Ok,
    Locked,
    Eagain,
    NoEnt,
    Perm,
    NoChunk,
    IndexTooBig,
    Quota,
    ChunkLost,
    NoSpace,
    ReadOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(EngineError::Io.raw_errno(), 5);
        assert_eq!(EngineError::TooBig.raw_errno(), 27);
        assert_eq!(EngineError::QuotaExceeded.raw_errno(), 122);
    }
}
