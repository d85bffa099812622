//! Chunk-server wire protocol: frame header, command codes and per-command
//! (de)serialization. All frames are `{cmd: u32, leng: u32, payload}`,
//! big-endian.

use anyhow::{ensure, Error};
use bytes::{BufMut, Bytes, BytesMut};

use cfs_api_types::ChunkId;

/// Command codes. Values are this engine's own stable numbering; the wire
/// is internal to the chunk-server protocol this client speaks and is not
/// required to match any other implementation's numeric encoding.
pub mod cmd {
    pub const ANTOAN_NOP: u32 = 0;
    pub const CLTOCS_READ: u32 = 200;
    pub const CSTOCL_READ_STATUS: u32 = 201;
    pub const CSTOCL_READ_DATA: u32 = 202;
    pub const CLTOCS_WRITE: u32 = 205;
    pub const CLTOCS_WRITE_DATA: u32 = 206;
    pub const CLTOCS_WRITE_FINISH: u32 = 207;
    pub const CSTOCL_WRITE_STATUS: u32 = 208;
}

/// Status byte carried in `CSTOCL_READ_STATUS` / `CSTOCL_WRITE_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsStatus {
    Ok,
    NotDone,
    Error(u8),
}

impl CsStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => CsStatus::Ok,
            1 => CsStatus::NotDone,
            other => CsStatus::Error(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            CsStatus::Ok => 0,
            CsStatus::NotDone => 1,
            CsStatus::Error(b) => b,
        }
    }
}

/// A decoded frame header: command and declared payload length.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub cmd: u32,
    pub leng: u32,
}

pub const HEADER_LEN: usize = 8;

impl FrameHeader {
    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.cmd.to_be_bytes());
        buf[4..8].copy_from_slice(&self.leng.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        ensure!(buf.len() >= HEADER_LEN, "short frame header");
        let cmd = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let leng = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        Ok(FrameHeader { cmd, leng })
    }
}

/// `CLTOCS_READ` request. `new_framing` selects whether the leading
/// `flags` byte (present for protocol-version-aware servers, `leng = 21`)
/// is emitted, or the legacy framing without it (`leng = 20`) is used.
pub struct ReadRequestFrame {
    pub chunk_id: u64,
    pub version: u32,
    pub offset: u32,
    pub size: u32,
    pub new_framing: bool,
}

impl ReadRequestFrame {
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(21);
        if self.new_framing {
            body.put_u8(0);
        }
        body.put_u64(self.chunk_id);
        body.put_u32(self.version);
        body.put_u32(self.offset);
        body.put_u32(self.size);

        let header = FrameHeader {
            cmd: cmd::CLTOCS_READ,
            leng: body.len() as u32,
        };
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_slice(&header.encode());
        out.put_slice(&body);
        out.freeze()
    }
}

/// `CSTOCL_READ_DATA` response header (the variable-length payload follows
/// separately so the caller can scatter it straight into the logical
/// buffer without an extra copy).
pub struct ReadDataHeader {
    pub chunk_id: u64,
    pub block_num: u16,
    pub offset_in_block: u16,
    pub size: u32,
    pub crc32: u32,
}

impl ReadDataHeader {
    pub const LEN: usize = 8 + 2 + 2 + 4 + 4;

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        ensure!(buf.len() >= Self::LEN, "short CSTOCL_READ_DATA header");
        let chunk_id = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let block_num = u16::from_be_bytes(buf[8..10].try_into().unwrap());
        let offset_in_block = u16::from_be_bytes(buf[10..12].try_into().unwrap());
        let size = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let crc32 = u32::from_be_bytes(buf[16..20].try_into().unwrap());
        Ok(ReadDataHeader {
            chunk_id,
            block_num,
            offset_in_block,
            size,
            crc32,
        })
    }
}

/// Verify the CRC32 of a just-received data payload against the header's
/// declared value.
pub fn verify_crc(header: &ReadDataHeader, payload: &[u8]) -> bool {
    crc32fast::hash(payload) == header.crc32
}

pub struct ReadStatusFrame {
    pub chunk_id: u64,
    pub status: CsStatus,
}

impl ReadStatusFrame {
    pub const BODY_LEN: usize = 9;

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        ensure!(buf.len() >= Self::BODY_LEN, "short CSTOCL_READ_STATUS body");
        let chunk_id = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let status = CsStatus::from_byte(buf[8]);
        Ok(ReadStatusFrame { chunk_id, status })
    }
}

/// `CLTOCS_WRITE`: opens a pipelined write chain. `forward_chain` is the
/// tail of the server chain (everything past this connection's peer), sent
/// so that peer can forward to the rest of the chain.
pub struct WriteOpenFrame {
    pub chunk_id: u64,
    pub version: u32,
    pub forward_chain: Vec<(u32, u16)>,
}

impl WriteOpenFrame {
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(12 + 6 * self.forward_chain.len());
        body.put_u64(self.chunk_id);
        body.put_u32(self.version);
        for (ip, port) in &self.forward_chain {
            body.put_u32(*ip);
            body.put_u16(*port);
        }

        let header = FrameHeader {
            cmd: cmd::CLTOCS_WRITE,
            leng: body.len() as u32,
        };
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_slice(&header.encode());
        out.put_slice(&body);
        out.freeze()
    }
}

/// A single pipelined write block, `CLTOCS_WRITE_DATA`.
pub struct WriteDataFrame<'a> {
    pub chunk_id: u64,
    pub writeid: u32,
    pub pos: u16,
    pub from: u16,
    pub data: &'a [u8],
}

impl<'a> WriteDataFrame<'a> {
    pub fn encode(&self) -> Bytes {
        let crc = crc32fast::hash(self.data);
        let mut body = BytesMut::with_capacity(8 + 4 + 2 + 2 + 4 + 4 + self.data.len());
        body.put_u64(self.chunk_id);
        body.put_u32(self.writeid);
        body.put_u16(self.pos);
        body.put_u16(self.from);
        body.put_u32(self.data.len() as u32);
        body.put_u32(crc);
        body.put_slice(self.data);

        let header = FrameHeader {
            cmd: cmd::CLTOCS_WRITE_DATA,
            leng: body.len() as u32,
        };
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_slice(&header.encode());
        out.put_slice(&body);
        out.freeze()
    }
}

pub struct WriteFinishFrame {
    pub chunk_id: u64,
    pub version: u32,
}

impl WriteFinishFrame {
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(12);
        body.put_u64(self.chunk_id);
        body.put_u32(self.version);

        let header = FrameHeader {
            cmd: cmd::CLTOCS_WRITE_FINISH,
            leng: body.len() as u32,
        };
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_slice(&header.encode());
        out.put_slice(&body);
        out.freeze()
    }
}

pub struct WriteStatusFrame {
    pub chunk_id: u64,
    pub writeid: u32,
    pub status: CsStatus,
}

impl WriteStatusFrame {
    pub const BODY_LEN: usize = 8 + 4 + 1;

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        ensure!(buf.len() >= Self::BODY_LEN, "short CSTOCL_WRITE_STATUS body");
        let chunk_id = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let writeid = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let status = CsStatus::from_byte(buf[12]);
        Ok(WriteStatusFrame {
            chunk_id,
            writeid,
            status,
        })
    }
}

/// Encode the `ANTOAN_NOP` keep-alive (an empty-payload frame).
pub fn encode_nop() -> Bytes {
    Bytes::copy_from_slice(&FrameHeader { cmd: cmd::ANTOAN_NOP, leng: 0 }.encode())
}

/// Fold the split-mode part index into `chunk_id`'s top byte. Used when
/// building [`ReadRequestFrame`]/write frames for a part.
pub fn split_chunk_id(chunk_id: ChunkId, part_count: usize, part: usize) -> u64 {
    cfs_api_types::encode_split_chunk_id(chunk_id, part_count, part)
}

/// Round-robin striping between a logical block index and its (part,
/// part-local block) address in split mode: block `i` lives on part
/// `i % part_count` at part-local block `i / part_count`.
pub fn split_part_of_block(block_index: u32, part_count: usize) -> (usize, u32) {
    let part_count = part_count as u32;
    ((block_index % part_count) as usize, block_index / part_count)
}

/// Inverse of [`split_part_of_block`].
pub fn logical_block_of_split(part: usize, part_block: u32, part_count: usize) -> u32 {
    part_block * (part_count as u32) + part as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = FrameHeader { cmd: 42, leng: 1234 };
        let encoded = h.encode();
        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.cmd, 42);
        assert_eq!(decoded.leng, 1234);
    }

    #[test]
    fn read_request_frame_new_framing_has_flags_byte() {
        let frame = ReadRequestFrame {
            chunk_id: 7,
            version: 1,
            offset: 0,
            size: 65536,
            new_framing: true,
        };
        let bytes = frame.encode();
        let header = FrameHeader::decode(&bytes).unwrap();
        assert_eq!(header.cmd, cmd::CLTOCS_READ);
        assert_eq!(header.leng, 21);
    }

    #[test]
    fn read_request_frame_legacy_framing_omits_flags_byte() {
        let frame = ReadRequestFrame {
            chunk_id: 7,
            version: 1,
            offset: 0,
            size: 65536,
            new_framing: false,
        };
        let bytes = frame.encode();
        let header = FrameHeader::decode(&bytes).unwrap();
        assert_eq!(header.leng, 20);
    }

    #[test]
    fn crc_validates_matching_payload_and_rejects_corruption() {
        let payload = b"hello chunk server";
        let crc = crc32fast::hash(payload);
        let header = ReadDataHeader {
            chunk_id: 1,
            block_num: 0,
            offset_in_block: 0,
            size: payload.len() as u32,
            crc32: crc,
        };
        assert!(verify_crc(&header, payload));
        assert!(!verify_crc(&header, b"corrupted payload!!"));
    }

    #[test]
    fn write_data_frame_embeds_computed_crc() {
        let data = b"some block data";
        let frame = WriteDataFrame {
            chunk_id: 5,
            writeid: 1,
            pos: 0,
            from: 0,
            data,
        };
        let bytes = frame.encode();
        let body = &bytes[HEADER_LEN..];
        let crc_off = 8 + 4 + 2 + 2 + 4;
        let crc = u32::from_be_bytes(body[crc_off..crc_off + 4].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(data));
    }
}
