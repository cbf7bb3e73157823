//! Single-result I/O operations.
//!
//! Each function performs exactly one OS-level accept, read or write and
//! resolves once, with either a value or an error. Both runtimes classify
//! their results through this module, so a read of zero bytes, an orderly
//! EOF and an abrupt disconnect mean the same thing everywhere.
//!
//! The async variants are cancel-safe: dropping the returned future abandons
//! the operation without consuming data. Releasing the socket is left to the
//! owner of the stream, which closes it on drop.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Outcome of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n > 0` bytes were read.
    Data(usize),
    /// Nothing was available; the connection stays open.
    Empty,
    /// The peer closed its side of the connection.
    Closed,
}

/// Classify an I/O error as the peer going away rather than a local failure.
pub fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::WriteZero
            | io::ErrorKind::UnexpectedEof
    )
}

/// One non-blocking read from a readiness-driven stream.
///
/// `WouldBlock` and `Interrupted` become [`ReadOutcome::Empty`].
pub fn read_nonblocking<R: Read>(stream: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    debug_assert!(!buf.is_empty(), "read into a full buffer");
    match stream.read(buf) {
        Ok(0) => Ok(ReadOutcome::Closed),
        Ok(n) => Ok(ReadOutcome::Data(n)),
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
        {
            Ok(ReadOutcome::Empty)
        }
        Err(e) => Err(e),
    }
}

/// One non-blocking write to a readiness-driven stream.
///
/// Returns `Ok(0)` when the socket cannot take more bytes right now. A write
/// that the OS reports as zero bytes is a disconnect.
pub fn write_nonblocking<W: Write>(stream: &mut W, buf: &[u8]) -> io::Result<usize> {
    match stream.write(buf) {
        Ok(0) if !buf.is_empty() => Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "write returned 0",
        )),
        Ok(n) => Ok(n),
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
        {
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// Accept the next connection.
pub async fn accept(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    listener.accept().await
}

/// Read once into the spare capacity of `buf`, suspending until data, EOF or an error.
pub async fn read<R>(reader: &mut R, buf: &mut bytes::BytesMut) -> io::Result<ReadOutcome>
where
    R: AsyncRead + Unpin,
{
    match reader.read_buf(buf).await {
        Ok(0) => Ok(ReadOutcome::Closed),
        Ok(n) => Ok(ReadOutcome::Data(n)),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::Empty),
        Err(e) => Err(e),
    }
}

/// Write once, suspending until at least one byte is accepted or an error.
///
/// May write fewer bytes than `buf` holds; callers loop on the remainder.
pub async fn write<W>(writer: &mut W, buf: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    match writer.write(buf).await {
        Ok(0) if !buf.is_empty() => Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "write returned 0",
        )),
        Ok(n) => Ok(n),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(e),
    }
}
