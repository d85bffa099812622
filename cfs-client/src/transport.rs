//! Thin async framing helpers shared by the read and write workers.
//! Factored out so `read_engine` and `write_engine` don't each
//! reimplement socket plumbing around [`crate::wire::FrameHeader`].

use anyhow::{ensure, Error};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::wire::{FrameHeader, HEADER_LEN};

/// Generic over the concrete stream half so callers holding a whole
/// [`TcpStream`] (the connection pool) and callers split into
/// `OwnedReadHalf`/`OwnedWriteHalf` (the pipelined write worker) share one
/// framing implementation.
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W, bytes: &[u8]) -> Result<(), Error> {
    stream.write_all(bytes).await?;
    Ok(())
}

pub async fn read_header<R: AsyncRead + Unpin + ?Sized>(stream: &mut R) -> Result<FrameHeader, Error> {
    let mut buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut buf).await?;
    FrameHeader::decode(&buf)
}

pub async fn read_body<R: AsyncRead + Unpin + ?Sized>(stream: &mut R, leng: u32) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; leng as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Dial a chunk server, enabling `TCP_NODELAY`.
pub async fn dial(ip: u32, port: u16) -> Result<TcpStream, Error> {
    let addr = (std::net::Ipv4Addr::from(ip), port);
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub fn ensure_leng_matches(declared: u32, expected: usize) -> Result<(), Error> {
    ensure!(declared as usize == expected, "frame length mismatch");
    Ok(())
}
