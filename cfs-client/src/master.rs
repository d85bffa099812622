//! `MasterClient`: contract only. Session registration, keep-alives and
//! reconnect live outside this crate; the engine only needs
//! the request/response shapes below and a mapping from master status codes
//! to the errors and retry signals it acts on.

use async_trait::async_trait;

use cfs_api_types::{ChunkId, ChunkVersion, CsChain, EngineError, MasterStatus, RetryableError};

/// Flags accompanying `fs_readchunk`/`fs_writechunk`, e.g. whether the
/// caller holds the "superuser" bit that bypasses quota checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterOpFlags {
    pub superuser: bool,
}

/// Result of a successful `READ_CHUNK`/`WRITE_CHUNK` round trip: chunk
/// identity plus its server chain, still in wire (`csdataver`) shape.
#[derive(Debug, Clone)]
pub struct ChunkLocation {
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub chain: CsChain,
}

/// Capabilities the connected master advertises. Modeled as booleans rather
/// than a literal protocol-version comparison so the engine never hardcodes
/// a wire version number (see DESIGN.md, Open Question: append-mode gate).
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterCapabilities {
    /// Master supports `fs_readchunk`/`fs_writechunk` responses recent
    /// enough for [`crate::chunk_loc_cache::ChunkLocCache`] to be trusted.
    /// Only the feature-compatible protocol branch should trust a
    /// cached location without re-resolving it.
    pub chunk_loc_cache_eligible: bool,
    /// Master supports atomic reserve-and-extend append writes; otherwise
    /// the engine falls back to length-then-write.
    pub atomic_append: bool,
}

/// RPC surface the read/write engines need from the master session. The
/// façade owns the concrete implementation (connection, auth, retries at
/// the transport level); everything here is request/response only.
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Capabilities negotiated at session setup.
    fn capabilities(&self) -> MasterCapabilities;

    /// `READ_CHUNK`: resolve `(inode, chunk_index)` to a chunk location.
    async fn read_chunk(
        &self,
        inode: u64,
        chunk_index: u32,
    ) -> Result<ChunkLocation, MasterStatus>;

    /// `WRITE_CHUNK`: allocate or resolve the chunk for writing, returning
    /// its (possibly new) version and chain.
    async fn write_chunk(
        &self,
        inode: u64,
        chunk_index: u32,
        flags: MasterOpFlags,
    ) -> Result<ChunkLocation, MasterStatus>;

    /// `WRITE_CHUNK_END`: commit a finished write, publishing `max_fleng`
    /// for this chunk. `unbreakable` mirrors the rule that this call is
    /// skipped (not sent) when another master op is still pending on the
    /// same chunk and retries remain.
    async fn write_chunk_end(
        &self,
        inode: u64,
        chunk_index: u32,
        chunk_id: ChunkId,
        version: ChunkVersion,
        max_fleng: u64,
        flags: MasterOpFlags,
    ) -> Result<(), MasterStatus>;

    /// `TRUNCATE`: publish a new canonical length for `inode`.
    async fn truncate(&self, inode: u64, length: u64) -> Result<(), MasterStatus>;

    /// `STATFS`: filesystem-wide statistics. Every handle is assumed to
    /// refer to the single mounted file system; `inode` is accepted only
    /// so callers can thread it through if a future façade needs
    /// per-handle identity, and is otherwise ignored by implementations of
    /// this trait.
    async fn statfs(&self, inode: u64) -> Result<StatFs, MasterStatus>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub total_space: u64,
    pub avail_space: u64,
    pub total_inodes: u64,
    pub avail_inodes: u64,
}

/// Outcome of classifying a [`MasterStatus`] at a call site.
pub enum MasterOutcome {
    Retry(RetryableError),
    Fail(EngineError),
}

/// Map a master status to either an internal retry signal or a terminal
/// engine error. `for_write` selects the write path's additional
/// `EDQUOT`/`ENOSPC`/`EROFS` outcomes.
pub fn classify(status: MasterStatus, error_on_lost_chunk: bool, error_on_no_space: bool) -> MasterOutcome {
    use MasterOutcome::*;
    match status {
        MasterStatus::Ok => Fail(EngineError::Io), // callers never classify Ok; defensive fallback
        MasterStatus::Locked => Retry(RetryableError::Locked),
        MasterStatus::Eagain => Retry(RetryableError::Eagain),
        MasterStatus::NoEnt | MasterStatus::Perm | MasterStatus::NoChunk => {
            Fail(EngineError::BadFileDescriptor)
        }
        MasterStatus::IndexTooBig => Fail(EngineError::InvalidArgument),
        MasterStatus::Quota => Fail(EngineError::QuotaExceeded),
        MasterStatus::ChunkLost => {
            if error_on_lost_chunk {
                Fail(EngineError::NoChunkServer)
            } else {
                Retry(RetryableError::Eagain)
            }
        }
        MasterStatus::NoSpace => {
            if error_on_no_space {
                Fail(EngineError::NoSpace)
            } else {
                Retry(RetryableError::Eagain)
            }
        }
        MasterStatus::ReadOnly => Fail(EngineError::ReadOnlyFilesystem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_are_retried() {
        assert!(matches!(
            classify(MasterStatus::Locked, false, false),
            MasterOutcome::Retry(RetryableError::Locked)
        ));
        assert!(matches!(
            classify(MasterStatus::Eagain, false, false),
            MasterOutcome::Retry(RetryableError::Eagain)
        ));
    }

    #[test]
    fn chunk_lost_respects_error_on_lost_chunk_flag() {
        assert!(matches!(
            classify(MasterStatus::ChunkLost, false, false),
            MasterOutcome::Retry(_)
        ));
        assert!(matches!(
            classify(MasterStatus::ChunkLost, true, false),
            MasterOutcome::Fail(EngineError::NoChunkServer)
        ));
    }

    #[test]
    fn permanent_statuses_map_to_bad_file_descriptor() {
        assert!(matches!(
            classify(MasterStatus::NoEnt, false, false),
            MasterOutcome::Fail(EngineError::BadFileDescriptor)
        ));
        assert!(matches!(
            classify(MasterStatus::NoChunk, false, false),
            MasterOutcome::Fail(EngineError::BadFileDescriptor)
        ));
    }
}
