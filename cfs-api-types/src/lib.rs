//! Shared types for the chunked file system client engine: chunk/server
//! identity, wire layout constants, error kinds and engine configuration.

pub mod chunk;
pub mod config;
pub mod error;

pub use chunk::{
    block_index_of, chunk_index_of, chunk_start_offset, encode_split_chunk_id, ChunkId, ChunkVersion,
    CsChain, ServerDescriptor, BLOCKS_PER_CHUNK, BLOCK_SIZE, CHUNK_INDEX_SHIFT, CHUNK_SIZE,
    MAX_FILE_SIZE,
};
pub use config::EngineConfig;
pub use error::{EngineError, MasterStatus, RetryableError};
