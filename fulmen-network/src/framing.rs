//! Chunked framing of protocol messages over a bearer.
//!
//! A message's serialized bytes travel as one or more chunks, each a
//! big-endian `u16` length followed by that many content bytes, terminated
//! by the two-byte end marker `00 00`. A chunk sequence delimits exactly one
//! message; two messages never share a sequence.

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::trace;

#[cfg(not(target_os = "windows"))]
use tokio::net::UnixStream;

/// Protocol value that defines max chunk content length
pub const MAX_CHUNK_PAYLOAD_LENGTH: usize = 65535;

/// Two zero bytes closing a message's chunk sequence
pub const END_MARKER: [u8; 2] = [0x00, 0x00];

const BUFFER_LEN: usize = 1024 * 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bearer I/O error")]
    BearerIo(#[source] tokio::io::Error),

    #[error("deadline expired while waiting on the bearer")]
    Timeout,

    #[error("chunk stream ended mid-message")]
    Incomplete,
}

#[cfg(target_os = "windows")]
pub enum Bearer {
    Tcp(TcpStream),
}

#[cfg(not(target_os = "windows"))]
pub enum Bearer {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Bearer {
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self, tokio::io::Error> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Ok(Self::Tcp(stream))
    }

    pub async fn accept_tcp(listener: &TcpListener) -> tokio::io::Result<(Self, SocketAddr)> {
        let (stream, addr) = listener.accept().await?;
        Ok((Self::Tcp(stream), addr))
    }

    #[cfg(not(target_os = "windows"))]
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self, tokio::io::Error> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::Unix(stream))
    }
}

impl AsyncRead for Bearer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<tokio::io::Result<()>> {
        match self.get_mut() {
            Bearer::Tcp(x) => Pin::new(x).poll_read(cx, buf),
            #[cfg(not(target_os = "windows"))]
            Bearer::Unix(x) => Pin::new(x).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Bearer {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<tokio::io::Result<usize>> {
        match self.get_mut() {
            Bearer::Tcp(x) => Pin::new(x).poll_write(cx, buf),
            #[cfg(not(target_os = "windows"))]
            Bearer::Unix(x) => Pin::new(x).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<tokio::io::Result<()>> {
        match self.get_mut() {
            Bearer::Tcp(x) => Pin::new(x).poll_flush(cx),
            #[cfg(not(target_os = "windows"))]
            Bearer::Unix(x) => Pin::new(x).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<tokio::io::Result<()>> {
        match self.get_mut() {
            Bearer::Tcp(x) => Pin::new(x).poll_shutdown(cx),
            #[cfg(not(target_os = "windows"))]
            Bearer::Unix(x) => Pin::new(x).poll_shutdown(cx),
        }
    }
}

/// Splits a message payload into chunks, appending the full frame
/// (headers, content and end marker) to `out`. Any split point is legal;
/// we always cut at the maximum content length.
pub fn chunk(payload: &[u8], out: &mut BytesMut) {
    let headers = payload.len() / MAX_CHUNK_PAYLOAD_LENGTH + 1;
    out.reserve(payload.len() + headers * 2 + END_MARKER.len());

    for piece in payload.chunks(MAX_CHUNK_PAYLOAD_LENGTH) {
        out.put_u16(piece.len() as u16);
        out.put_slice(piece);
    }

    out.put_slice(&END_MARKER);
}

/// Reassembles one message from a frame, returning the content and the
/// number of bytes consumed
pub fn dechunk(input: &[u8]) -> Result<(Vec<u8>, usize), Error> {
    let mut out = Vec::new();
    let mut pos = 0;

    loop {
        if input.len() - pos < 2 {
            return Err(Error::Incomplete);
        }

        let len = NetworkEndian::read_u16(&input[pos..]) as usize;
        pos += 2;

        if len == 0 {
            return Ok((out, pos));
        }

        if input.len() - pos < len {
            return Err(Error::Incomplete);
        }

        out.extend_from_slice(&input[pos..pos + len]);
        pos += len;
    }
}

/// A bearer abstraction that hides the complexity of chunked messages.
///
/// Outgoing frames are assembled in a reusable pre-sized buffer and written
/// in a single call; incoming chunks accumulate in a second reusable buffer
/// until the end marker closes the message. Optional deadlines cover whole
/// message reads and writes; an expired deadline is fatal to the session
/// that owns the buffer.
pub struct FrameBuffer<S> {
    stream: S,
    egress: BytesMut,
    ingress: BytesMut,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl<S> FrameBuffer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            egress: BytesMut::with_capacity(BUFFER_LEN),
            ingress: BytesMut::with_capacity(BUFFER_LEN),
            read_timeout: None,
            write_timeout: None,
        }
    }

    pub fn set_read_timeout(&mut self, limit: Option<Duration>) {
        self.read_timeout = limit;
    }

    pub fn set_write_timeout(&mut self, limit: Option<Duration>) {
        self.write_timeout = limit;
    }

    /// Writes one message as a chunk sequence and flushes the bearer
    pub async fn write_message(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.egress.clear();
        chunk(payload, &mut self.egress);

        if tracing::event_enabled!(tracing::Level::TRACE) {
            trace!(data = hex::encode(payload), "write to bearer");
        }

        match self.write_timeout {
            Some(limit) => timeout(limit, write_frame(&mut self.stream, &self.egress))
                .await
                .map_err(|_| Error::Timeout)??,
            None => write_frame(&mut self.stream, &self.egress).await?,
        }

        Ok(())
    }

    /// Reads chunks off the bearer until an end marker closes the message
    pub async fn read_message(&mut self) -> Result<Bytes, Error> {
        self.ingress.clear();

        match self.read_timeout {
            Some(limit) => timeout(limit, read_frame(&mut self.stream, &mut self.ingress))
                .await
                .map_err(|_| Error::Timeout)??,
            None => read_frame(&mut self.stream, &mut self.ingress).await?,
        }

        let message = self.ingress.split().freeze();

        if tracing::event_enabled!(tracing::Level::TRACE) {
            trace!(data = hex::encode(&message), "read from bearer");
        }

        Ok(message)
    }

    /// Gives back the underlying stream
    pub fn unwrap(self) -> S {
        self.stream
    }
}

async fn write_frame<S>(stream: &mut S, frame: &[u8]) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(frame).await.map_err(Error::BearerIo)?;
    stream.flush().await.map_err(Error::BearerIo)?;

    Ok(())
}

async fn read_frame<S>(stream: &mut S, buf: &mut BytesMut) -> Result<(), Error>
where
    S: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; 2];
        stream
            .read_exact(&mut header)
            .await
            .map_err(Error::BearerIo)?;

        let len = NetworkEndian::read_u16(&header) as usize;

        if len == 0 {
            trace!(total = buf.len(), "message complete");
            break Ok(());
        }

        let start = buf.len();
        buf.resize(start + len, 0);

        stream
            .read_exact(&mut buf[start..])
            .await
            .map_err(Error::BearerIo)?;

        trace!(len, "chunk received");
    }
}
