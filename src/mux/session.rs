//! Smux-framed session
//!
//! The smux wire format is an 8-byte little-endian header per frame:
//! version, command (SYN opens a stream, FIN half-closes it, PSH
//! carries payload, NOP is a keep-alive), payload length and stream
//! id. Clients allocate odd stream ids.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

const SMUX_VERSION: u8 = 1;
const CMD_SYN: u8 = 0;
const CMD_FIN: u8 = 1;
const CMD_PSH: u8 = 2;
const CMD_NOP: u8 = 3;

const HEADER_LEN: usize = 8;
const MAX_PAYLOAD: usize = 32 * 1024;

fn encode_frame(out: &mut BytesMut, cmd: u8, stream_id: u32, payload: &[u8]) {
    out.reserve(HEADER_LEN + payload.len());
    out.put_u8(SMUX_VERSION);
    out.put_u8(cmd);
    out.put_u16_le(payload.len() as u16);
    out.put_u32_le(stream_id);
    out.put_slice(payload);
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(u8, u32, Bytes)>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut buf = &header[..];
    let version = buf.get_u8();
    if version != SMUX_VERSION {
        return Err(Error::BadVersion(version));
    }
    let cmd = buf.get_u8();
    let len = buf.get_u16_le() as usize;
    let stream_id = buf.get_u32_le();
    let payload = if len > 0 {
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Bytes::from(payload)
    } else {
        Bytes::new()
    };
    Ok(Some((cmd, stream_id, payload)))
}

enum StreamEvent {
    Data(Bytes),
    End,
}

type StreamMap = Arc<DashMap<u32, mpsc::UnboundedSender<StreamEvent>>>;

/// One end of a smux connection. Either side can open streams; the
/// accepting side takes inbound streams from [`MuxSession::accept`].
pub struct MuxSession {
    out_tx: mpsc::UnboundedSender<Bytes>,
    streams: StreamMap,
    next_id: Mutex<u32>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    closed: Arc<AtomicBool>,
}

impl MuxSession {
    /// Client end: stream ids 1, 3, 5, ...
    pub fn client<S>(transport: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, 1)
    }

    /// Server end: stream ids 2, 4, 6, ...
    pub fn server<S>(transport: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, 2)
    }

    fn new<S>(transport: S, first_id: u32) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let streams: StreamMap = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let session = Arc::new(MuxSession {
            out_tx: out_tx.clone(),
            streams: streams.clone(),
            next_id: Mutex::new(first_id),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed: closed.clone(),
        });

        tokio::spawn(write_loop(write_half, out_rx));
        tokio::spawn(read_loop(
            read_half, streams, out_tx, accept_tx, closed,
        ));
        session
    }

    /// Open an outbound stream.
    pub fn open(&self) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        let stream_id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next = next.wrapping_add(2);
            id
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(stream_id, tx);

        let mut frame = BytesMut::new();
        encode_frame(&mut frame, CMD_SYN, stream_id, &[]);
        if self.out_tx.send(frame.freeze()).is_err() {
            self.streams.remove(&stream_id);
            return Err(Error::StreamClosed);
        }
        trace!(stream_id, "opened smux stream");
        Ok(MuxStream {
            stream_id,
            out_tx: self.out_tx.clone(),
            streams: self.streams.clone(),
            events: rx,
            recv_buf: BytesMut::new(),
            read_done: false,
            sent_fin: false,
        })
    }

    /// Take the next inbound stream. `None` once the transport closed.
    pub async fn accept(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("smux transport write failed: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            debug!("smux transport flush failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    streams: StreamMap,
    out_tx: mpsc::UnboundedSender<Bytes>,
    accept_tx: mpsc::UnboundedSender<MuxStream>,
    closed: Arc<AtomicBool>,
) {
    loop {
        let (cmd, stream_id, payload) = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("smux transport read failed: {}", e);
                break;
            }
        };
        match cmd {
            CMD_NOP => continue,
            CMD_SYN => {
                if streams.contains_key(&stream_id) {
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                streams.insert(stream_id, tx);
                let stream = MuxStream {
                    stream_id,
                    out_tx: out_tx.clone(),
                    streams: streams.clone(),
                    events: rx,
                    recv_buf: BytesMut::new(),
                    read_done: false,
                    sent_fin: false,
                };
                if accept_tx.send(stream).is_err() {
                    // Nobody is accepting; refuse the stream.
                    streams.remove(&stream_id);
                    let mut frame = BytesMut::new();
                    encode_frame(&mut frame, CMD_FIN, stream_id, &[]);
                    let _ = out_tx.send(frame.freeze());
                }
            }
            CMD_PSH => {
                if let Some(entry) = streams.get(&stream_id) {
                    let _ = entry.send(StreamEvent::Data(payload));
                }
            }
            CMD_FIN => {
                if let Some((_, tx)) = streams.remove(&stream_id) {
                    let _ = tx.send(StreamEvent::End);
                }
            }
            other => {
                debug!(cmd = other, stream_id, "unknown smux command");
            }
        }
    }
    closed.store(true, Ordering::Release);
    streams.retain(|_, tx| {
        let _ = tx.send(StreamEvent::End);
        false
    });
}

/// One logical stream of a [`MuxSession`].
pub struct MuxStream {
    stream_id: u32,
    out_tx: mpsc::UnboundedSender<Bytes>,
    streams: StreamMap,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    recv_buf: BytesMut,
    read_done: bool,
    sent_fin: bool,
}

impl MuxStream {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    fn queue_fin(&mut self) {
        if !self.sent_fin {
            self.sent_fin = true;
            let mut frame = BytesMut::new();
            encode_frame(&mut frame, CMD_FIN, self.stream_id, &[]);
            let _ = self.out_tx.send(frame.freeze());
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.recv_buf.is_empty() {
                let n = std::cmp::min(buf.remaining(), this.recv_buf.len());
                buf.put_slice(&this.recv_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.read_done {
                return Poll::Ready(Ok(()));
            }
            match std::task::ready!(this.events.poll_recv(cx)) {
                Some(StreamEvent::Data(bytes)) => this.recv_buf.extend_from_slice(&bytes),
                Some(StreamEvent::End) | None => this.read_done = true,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.sent_fin {
            return Poll::Ready(Err(io::Error::from(Error::StreamClosed)));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let chunk = &buf[..std::cmp::min(buf.len(), MAX_PAYLOAD)];
        let mut frame = BytesMut::new();
        encode_frame(&mut frame, CMD_PSH, this.stream_id, chunk);
        if this.out_tx.send(frame.freeze()).is_err() {
            return Poll::Ready(Err(io::Error::from(Error::StreamClosed)));
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.queue_fin();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.queue_fin();
        self.streams.remove(&self.stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_accept_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::client(client_io);
        let server = MuxSession::server(server_io);

        let mut out = client.open().unwrap();
        out.write_all(b"hello").await.unwrap();

        let mut inbound = server.accept().await.unwrap();
        assert_eq!(inbound.stream_id(), 1);
        let mut got = [0u8; 5];
        inbound.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        inbound.write_all(b"world").await.unwrap();
        let mut reply = [0u8; 5];
        out.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world");
    }

    #[tokio::test]
    async fn test_client_ids_are_odd() {
        let (client_io, _server_io) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::client(client_io);
        assert_eq!(client.open().unwrap().stream_id(), 1);
        assert_eq!(client.open().unwrap().stream_id(), 3);
        assert_eq!(client.open().unwrap().stream_id(), 5);
    }

    #[tokio::test]
    async fn test_fin_ends_reader() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::client(client_io);
        let server = MuxSession::server(server_io);

        let mut out = client.open().unwrap();
        out.write_all(b"bye").await.unwrap();
        out.shutdown().await.unwrap();

        let mut inbound = server.accept().await.unwrap();
        let mut all = Vec::new();
        inbound.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"bye");
    }

    #[tokio::test]
    async fn test_stream_count_tracks_lifecycle() {
        let (client_io, _server_io) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::client(client_io);
        assert_eq!(client.num_streams(), 0);
        let stream = client.open().unwrap();
        assert_eq!(client.num_streams(), 1);
        drop(stream);
        assert_eq!(client.num_streams(), 0);
    }

    #[tokio::test]
    async fn test_large_payload_is_chunked() {
        let (client_io, server_io) = tokio::io::duplex(512 * 1024);
        let client = MuxSession::client(client_io);
        let server = MuxSession::server(server_io);

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let out = client.open().unwrap();
        let send = payload.clone();
        tokio::spawn(async move {
            let mut out = out;
            out.write_all(&send).await.unwrap();
            out.shutdown().await.unwrap();
        });

        let mut inbound = server.accept().await.unwrap();
        let mut got = Vec::new();
        inbound.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, payload);
    }
}
