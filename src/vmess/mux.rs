//! Mini-mux: frame-level stream multiplexing inside one VMess body
//!
//! Frames share a single record layer. Each frame is a big-endian u16
//! metadata length, the metadata (session id, status, option, and for
//! `New` frames a network byte plus destination), then, when the Data
//! option is set, a u16-prefixed payload.
//!
//! [`MuxClient`] drives the client end of a `Command::Mux` connection;
//! [`MuxServer`] serves the other end, dialing one backend stream per
//! session through a [`StreamHandler`].

use crate::common::net::Address;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const STATUS_NEW: u8 = 0x01;
const STATUS_KEEP: u8 = 0x02;
const STATUS_END: u8 = 0x03;
const STATUS_KEEP_ALIVE: u8 = 0x04;

const OPTION_DATA: u8 = 0x01;
const OPTION_ERROR: u8 = 0x02;

const WRITE_CHUNK: usize = 16 * 1024;

/// Transport network requested for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    fn protocol_byte(self) -> u8 {
        match self {
            Network::Tcp => 1,
            Network::Udp => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Network::Tcp),
            2 => Ok(Network::Udp),
            other => Err(Error::protocol(format!("Unknown mux network: {}", other))),
        }
    }
}

#[derive(Debug)]
struct Frame {
    session_id: u16,
    status: u8,
    option: u8,
    destination: Option<(Network, Address, u16)>,
    payload: Bytes,
}

fn encode_frame(
    out: &mut BytesMut,
    session_id: u16,
    status: u8,
    option: u8,
    destination: Option<(Network, &Address, u16)>,
    payload: &[u8],
) -> Result<()> {
    let mut meta = BytesMut::with_capacity(8);
    meta.put_u16(session_id);
    meta.put_u8(status);
    meta.put_u8(option);
    if let Some((network, address, port)) = destination {
        meta.put_u8(network.protocol_byte());
        address.write_vmess_addr_port(&mut meta, port)?;
    }
    out.put_u16(meta.len() as u16);
    out.unsplit(meta);
    if option & OPTION_DATA != 0 {
        let len = u16::try_from(payload.len())
            .map_err(|_| Error::protocol("Mux payload too large"))?;
        out.put_u16(len);
        out.put_slice(payload);
    }
    Ok(())
}

/// Read one frame. `None` on clean end of stream at a frame boundary.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let meta_len = u16::from_be_bytes(len_buf) as usize;
    if meta_len < 4 {
        return Err(Error::protocol("Short mux frame metadata"));
    }
    let mut meta = vec![0u8; meta_len];
    reader.read_exact(&mut meta).await?;

    let mut buf = &meta[..];
    let session_id = buf.get_u16();
    let status = buf.get_u8();
    let option = buf.get_u8();
    let destination = if buf.has_remaining() {
        let network = Network::from_byte(buf.get_u8())?;
        let (address, port) = Address::read_vmess_addr_port(&mut buf)?;
        // Trailing metadata from newer peers is ignored.
        Some((network, address, port))
    } else {
        None
    };

    let payload = if option & OPTION_DATA != 0 {
        let mut plen_buf = [0u8; 2];
        reader.read_exact(&mut plen_buf).await?;
        let mut payload = vec![0u8; u16::from_be_bytes(plen_buf) as usize];
        reader.read_exact(&mut payload).await?;
        Bytes::from(payload)
    } else {
        Bytes::new()
    };

    Ok(Some(Frame {
        session_id,
        status,
        option,
        destination,
        payload,
    }))
}

enum StreamEvent {
    Data(Bytes),
    End,
    Error,
}

type StreamMap = Arc<DashMap<u16, mpsc::UnboundedSender<StreamEvent>>>;

fn send_end(out: &mpsc::UnboundedSender<Bytes>, session_id: u16, error: bool) {
    let option = if error { OPTION_ERROR } else { 0 };
    let mut buf = BytesMut::new();
    if encode_frame(&mut buf, session_id, STATUS_END, option, None, &[]).is_ok() {
        let _ = out.send(buf.freeze());
    }
}

/// Client end of a multiplexed connection.
///
/// Owns the transport: a write task drains queued frames, a read task
/// dispatches inbound frames to their sessions. Streams opened after
/// the transport dies fail with [`Error::StreamClosed`].
pub struct MuxClient {
    out_tx: mpsc::UnboundedSender<Bytes>,
    streams: StreamMap,
    next_id: Mutex<u16>,
}

impl MuxClient {
    pub fn new<S>(transport: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let streams: StreamMap = Arc::new(DashMap::new());

        tokio::spawn(write_loop(write_half, out_rx));
        tokio::spawn(client_read_loop(read_half, streams.clone(), out_tx.clone()));

        MuxClient {
            out_tx,
            streams,
            next_id: Mutex::new(1),
        }
    }

    /// Open a logical stream to `address:port`.
    pub fn open(&self, network: Network, address: Address, port: u16) -> Result<MuxStream> {
        let session_id = self.allocate_id()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(session_id, tx);

        let mut buf = BytesMut::new();
        encode_frame(
            &mut buf,
            session_id,
            STATUS_NEW,
            0,
            Some((network, &address, port)),
            &[],
        )?;
        if self.out_tx.send(buf.freeze()).is_err() {
            self.streams.remove(&session_id);
            return Err(Error::StreamClosed);
        }
        trace!(session_id, %port, "opened mux stream");

        Ok(MuxStream {
            session_id,
            out_tx: self.out_tx.clone(),
            streams: self.streams.clone(),
            events: rx,
            recv_buf: BytesMut::new(),
            read_done: false,
            sent_end: false,
        })
    }

    fn allocate_id(&self) -> Result<u16> {
        let mut next = self.next_id.lock();
        for _ in 0..=u16::MAX {
            let id = *next;
            *next = next.wrapping_add(1).max(1);
            if !self.streams.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::protocol("Mux session ids exhausted"))
    }

    /// Number of sessions currently open.
    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("mux transport write failed: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            debug!("mux transport flush failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn client_read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    streams: StreamMap,
    out_tx: mpsc::UnboundedSender<Bytes>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("mux transport read failed: {}", e);
                break;
            }
        };
        match frame.status {
            STATUS_KEEP_ALIVE => continue,
            STATUS_KEEP => {
                let Some(entry) = streams.get(&frame.session_id) else {
                    send_end(&out_tx, frame.session_id, false);
                    continue;
                };
                if frame.option & OPTION_DATA != 0 {
                    let _ = entry.send(StreamEvent::Data(frame.payload));
                }
            }
            STATUS_END => {
                if let Some((_, tx)) = streams.remove(&frame.session_id) {
                    let event = if frame.option & OPTION_ERROR != 0 {
                        StreamEvent::Error
                    } else {
                        StreamEvent::End
                    };
                    let _ = tx.send(event);
                }
            }
            other => {
                warn!(status = other, session_id = frame.session_id, "unexpected mux frame");
                send_end(&out_tx, frame.session_id, false);
            }
        }
    }
    // Transport gone: every open session sees end of stream.
    streams.retain(|_, tx| {
        let _ = tx.send(StreamEvent::End);
        false
    });
}

/// One logical stream inside a multiplexed connection.
pub struct MuxStream {
    session_id: u16,
    out_tx: mpsc::UnboundedSender<Bytes>,
    streams: StreamMap,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    recv_buf: BytesMut,
    read_done: bool,
    sent_end: bool,
}

impl MuxStream {
    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    fn queue_end(&mut self) {
        if !self.sent_end {
            self.sent_end = true;
            send_end(&self.out_tx, self.session_id, false);
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
                Some(StreamEvent::Data(bytes)) => {
                    this.recv_buf.extend_from_slice(&bytes);
                }
                Some(StreamEvent::End) | None => {
                    this.read_done = true;
                }
                Some(StreamEvent::Error) => {
                    this.read_done = true;
                    return Poll::Ready(Err(Error::peer("Peer reported stream error").into()));
                }
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
        if this.sent_end {
            return Poll::Ready(Err(io::Error::from(Error::StreamClosed)));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let chunk = &buf[..std::cmp::min(buf.len(), WRITE_CHUNK)];
        let mut frame = BytesMut::new();
        encode_frame(
            &mut frame,
            this.session_id,
            STATUS_KEEP,
            OPTION_DATA,
            None,
            chunk,
        )
        .map_err(io::Error::from)?;
        if this.out_tx.send(frame.freeze()).is_err() {
            return Poll::Ready(Err(io::Error::from(Error::StreamClosed)));
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.queue_end();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.queue_end();
        self.streams.remove(&self.session_id);
    }
}

/// Dials one backend per mux session on the server side.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn open(
        &self,
        network: Network,
        address: Address,
        port: u16,
    ) -> Result<Box<dyn SessionIo>>;
}

/// Backend stream type returned by a [`StreamHandler`]
pub trait SessionIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionIo for T {}

/// Server end of a multiplexed connection.
pub struct MuxServer<H> {
    handler: Arc<H>,
}

impl<H: StreamHandler> MuxServer<H> {
    pub fn new(handler: H) -> Self {
        MuxServer {
            handler: Arc::new(handler),
        }
    }

    /// Run the session until the transport closes.
    pub async fn serve<S>(&self, transport: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, writer) = tokio::io::split(transport);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let sessions: StreamMap = Arc::new(DashMap::new());
        let write_task = tokio::spawn(write_loop(writer, out_rx));

        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!("mux transport read failed: {}", e);
                    break;
                }
            };
            match frame.status {
                STATUS_KEEP_ALIVE => continue,
                STATUS_NEW => {
                    let Some((network, address, port)) = frame.destination else {
                        send_end(&out_tx, frame.session_id, true);
                        continue;
                    };
                    let (tx, rx) = mpsc::unbounded_channel();
                    if frame.option & OPTION_DATA != 0 {
                        let _ = tx.send(StreamEvent::Data(frame.payload));
                    }
                    sessions.insert(frame.session_id, tx);
                    tokio::spawn(serve_session(
                        self.handler.clone(),
                        frame.session_id,
                        network,
                        address,
                        port,
                        rx,
                        out_tx.clone(),
                        sessions.clone(),
                    ));
                }
                STATUS_KEEP => {
                    let Some(entry) = sessions.get(&frame.session_id) else {
                        send_end(&out_tx, frame.session_id, false);
                        continue;
                    };
                    if frame.option & OPTION_DATA != 0 {
                        let _ = entry.send(StreamEvent::Data(frame.payload));
                    }
                }
                STATUS_END => {
                    if let Some((_, tx)) = sessions.remove(&frame.session_id) {
                        let _ = tx.send(StreamEvent::End);
                    }
                }
                other => {
                    warn!(status = other, session_id = frame.session_id, "unexpected mux frame");
                    send_end(&out_tx, frame.session_id, false);
                }
            }
        }

        sessions.retain(|_, tx| {
            let _ = tx.send(StreamEvent::End);
            false
        });
        drop(out_tx);
        let _ = write_task.await;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_session<H: StreamHandler>(
    handler: Arc<H>,
    session_id: u16,
    network: Network,
    address: Address,
    port: u16,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    out_tx: mpsc::UnboundedSender<Bytes>,
    sessions: StreamMap,
) {
    let mut backend = match handler.open(network, address, port).await {
        Ok(backend) => backend,
        Err(e) => {
            debug!(session_id, "mux backend dial failed: {}", e);
            sessions.remove(&session_id);
            send_end(&out_tx, session_id, true);
            return;
        }
    };

    let mut buf = vec![0u8; WRITE_CHUNK];
    let mut peer_done = false;
    loop {
        tokio::select! {
            event = events.recv(), if !peer_done => match event {
                Some(StreamEvent::Data(bytes)) => {
                    if backend.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Some(StreamEvent::End) | Some(StreamEvent::Error) | None => {
                    // Client finished writing; drain the backend.
                    let _ = backend.shutdown().await;
                    peer_done = true;
                }
            },
            read = backend.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut frame = BytesMut::new();
                    if encode_frame(
                        &mut frame,
                        session_id,
                        STATUS_KEEP,
                        OPTION_DATA,
                        None,
                        &buf[..n],
                    )
                    .is_err()
                    {
                        break;
                    }
                    if out_tx.send(frame.freeze()).is_err() {
                        break;
                    }
                }
            },
        }
    }

    sessions.remove(&session_id);
    send_end(&out_tx, session_id, false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::DuplexStream;

    struct EchoHandler;

    #[async_trait]
    impl StreamHandler for EchoHandler {
        async fn open(
            &self,
            network: Network,
            _address: Address,
            _port: u16,
        ) -> Result<Box<dyn SessionIo>> {
            assert_eq!(network, Network::Tcp);
            let (near, far) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(far);
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
            Ok(Box::new(near))
        }
    }

    fn spawn_server(transport: DuplexStream) {
        tokio::spawn(async move {
            MuxServer::new(EchoHandler).serve(transport).await.unwrap();
        });
    }

    #[tokio::test]
    async fn test_single_stream_echo() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        spawn_server(server_io);

        let client = MuxClient::new(client_io);
        let mut stream = client
            .open(Network::Tcp, Address::from("example.com"), 80)
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[tokio::test]
    async fn test_interleaved_streams() {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        spawn_server(server_io);

        let client = MuxClient::new(client_io);
        let mut streams = HashMap::new();
        for i in 0u16..4 {
            let stream = client
                .open(Network::Tcp, Address::from("example.com"), 80 + i)
                .unwrap();
            streams.insert(i, stream);
        }
        assert_eq!(client.num_streams(), 4);

        for (i, stream) in streams.iter_mut() {
            let message = format!("stream-{}", i);
            stream.write_all(message.as_bytes()).await.unwrap();
        }
        for (i, stream) in streams.iter_mut() {
            let expected = format!("stream-{}", i);
            let mut reply = vec![0u8; expected.len()];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_end_closes_stream() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        spawn_server(server_io);

        let client = MuxClient::new(client_io);
        let mut stream = client
            .open(Network::Tcp, Address::from("example.com"), 80)
            .unwrap();
        stream.write_all(b"bye").await.unwrap();
        let mut reply = [0u8; 3];
        stream.read_exact(&mut reply).await.unwrap();
        stream.shutdown().await.unwrap();

        // After our End the server tears the session down and echoes
        // an End back; the stream then reads as finished.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let mut buf = BytesMut::new();
        encode_frame(
            &mut buf,
            7,
            STATUS_NEW,
            OPTION_DATA,
            Some((Network::Tcp, &Address::from("example.com"), 443)),
            b"early",
        )
        .unwrap();

        let mut reader = std::io::Cursor::new(buf.to_vec());
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame.session_id, 7);
        assert_eq!(frame.status, STATUS_NEW);
        assert_eq!(
            frame.destination,
            Some((Network::Tcp, Address::from("example.com"), 443))
        );
        assert_eq!(&frame.payload[..], b"early");
    }

    #[tokio::test]
    async fn test_unknown_session_gets_end() {
        let (client_io, mut raw_server) = tokio::io::duplex(64 * 1024);
        let _client = MuxClient::new(client_io);

        // Send data for a session the client never opened.
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, 99, STATUS_KEEP, OPTION_DATA, None, b"stray").unwrap();
        raw_server.write_all(&buf).await.unwrap();

        let frame = read_frame(&mut raw_server).await.unwrap().unwrap();
        assert_eq!(frame.session_id, 99);
        assert_eq!(frame.status, STATUS_END);
    }
}
