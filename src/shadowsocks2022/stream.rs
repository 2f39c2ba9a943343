//! Shadowsocks-2022 TCP stream codec
//!
//! Client request: `salt || identity headers || seal(fixed header) ||
//! seal(variable header) || chunks...`. The fixed header carries the
//! header type and a unix timestamp; the variable header carries the
//! target address, padding and any early payload. The server response
//! echoes the request salt inside its own fixed header, which pins the
//! response to this request and defeats reflected replays.

use super::{
    check_timestamp, open_identity_header, seal_identity_header, Method, HEADER_TYPE_CLIENT,
    HEADER_TYPE_SERVER, MAX_PADDING_LENGTH, SALT_WINDOW,
};
use crate::chunk::{ChunkReader, ChunkWriter, MAX_PACKET_SIZE};
use crate::common::clock::Clock;
use crate::common::net::Address;
use crate::crypto::kdf::session_subkey;
use crate::crypto::TAG_SIZE;
use crate::replay::SaltPool;
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

/// Request fixed header: type, timestamp, variable header length
const FIXED_REQUEST_LEN: usize = 1 + 8 + 2;

/// Early payload carried inside the variable header is capped so the
/// whole header stays one chunk.
const MAX_EARLY_PAYLOAD: usize = 8192;

fn flush_buf<S: AsyncWrite + Unpin>(
    inner: &mut S,
    buf: &mut BytesMut,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    while !buf.is_empty() {
        let n = std::task::ready!(Pin::new(&mut *inner).poll_write(cx, buf))?;
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        let _ = buf.split_to(n);
    }
    Poll::Ready(Ok(()))
}

enum ReadState {
    Salt,
    FixedHeader,
    InitialPayload(usize),
    Streaming,
}

/// Client side of a Shadowsocks-2022 TCP connection.
///
/// The request header is written lazily: the first payload write rides
/// inside the variable header, and a read before any write flushes the
/// header with an empty payload so the server can respond.
pub struct ClientStream<S> {
    inner: S,
    method: Method,
    psks: Vec<Vec<u8>>,
    address: Address,
    port: u16,
    clock: Arc<dyn Clock>,
    request_salt: Vec<u8>,
    writer: Option<ChunkWriter>,
    write_buf: BytesMut,
    read_state: ReadState,
    reader: Option<ChunkReader>,
    read_buf: BytesMut,
    pending_plain: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientStream<S> {
    /// `psks` is the identity key chain; the last entry is the user key.
    pub fn new(
        inner: S,
        method: Method,
        psks: Vec<Vec<u8>>,
        address: Address,
        port: u16,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let psks = method.reduce_keys(&psks)?;
        let mut request_salt = vec![0u8; method.salt_len()];
        getrandom::getrandom(&mut request_salt).map_err(|e| Error::key(e.to_string()))?;

        Ok(ClientStream {
            inner,
            method,
            psks,
            address,
            port,
            clock,
            request_salt,
            writer: None,
            write_buf: BytesMut::new(),
            read_state: ReadState::Salt,
            reader: None,
            read_buf: BytesMut::with_capacity(4096),
            pending_plain: BytesMut::new(),
        })
    }

    /// Build the request header around `payload` and queue it for
    /// sending. Returns the number of payload bytes consumed.
    fn queue_request(&mut self, payload: &[u8]) -> Result<usize> {
        let early = std::cmp::min(payload.len(), MAX_EARLY_PAYLOAD);
        let user_psk = self.psks.last().cloned().unwrap_or_default();
        let subkey = session_subkey(&user_psk, &self.request_salt, self.method.key_len());
        let mut writer = ChunkWriter::new(self.method.session_cipher(&subkey)?);

        self.write_buf.put_slice(&self.request_salt);
        for i in 0..self.psks.len() - 1 {
            let block = seal_identity_header(
                self.method,
                &self.psks[i],
                &self.psks[i + 1],
                &self.request_salt,
            )?;
            self.write_buf.put_slice(&block);
        }

        // Variable header: address, padding, early payload
        let padding_len = if early < MAX_PADDING_LENGTH {
            rand::thread_rng().gen_range(1..=MAX_PADDING_LENGTH)
        } else {
            0
        };
        let mut variable =
            BytesMut::with_capacity(self.address.len() + 2 + padding_len + early);
        self.address.write_socks(&mut variable, self.port)?;
        variable.put_u16(padding_len as u16);
        variable.resize(variable.len() + padding_len, 0);
        variable.put_slice(&payload[..early]);

        let mut fixed = BytesMut::with_capacity(FIXED_REQUEST_LEN);
        fixed.put_u8(HEADER_TYPE_CLIENT);
        fixed.put_u64(self.clock.now());
        fixed.put_u16(variable.len() as u16);

        let sealed_fixed = writer.seal_chunk(&fixed)?;
        let sealed_variable = writer.seal_chunk(&variable)?;
        self.write_buf.put_slice(&sealed_fixed);
        self.write_buf.put_slice(&sealed_variable);

        self.writer = Some(writer);
        trace!(
            target = %self.address.to_string_with_port(self.port),
            early, padding_len, "queued request header"
        );
        Ok(early)
    }

    /// Advance the response parse as far as the buffered input allows.
    fn process_read_buf(&mut self) -> Result<()> {
        loop {
            match self.read_state {
                ReadState::Salt => {
                    let salt_len = self.method.salt_len();
                    if self.read_buf.len() < salt_len {
                        return Ok(());
                    }
                    let salt = self.read_buf.split_to(salt_len);
                    let user_psk = self.psks.last().cloned().unwrap_or_default();
                    let subkey = session_subkey(&user_psk, &salt, self.method.key_len());
                    self.reader = Some(ChunkReader::new(self.method.session_cipher(&subkey)?));
                    self.read_state = ReadState::FixedHeader;
                }
                ReadState::FixedHeader => {
                    let fixed_len = 1 + 8 + self.method.salt_len() + 2;
                    let reader = self.reader.as_mut().ok_or(Error::StreamClosed)?;
                    let Some(header) = reader.open_fixed(&mut self.read_buf, fixed_len)? else {
                        return Ok(());
                    };
                    let mut header = BytesMut::from(&header[..]);
                    let header_type = header.get_u8();
                    if header_type != HEADER_TYPE_SERVER {
                        return Err(Error::BadHeaderType(header_type));
                    }
                    check_timestamp(header.get_u64(), self.clock.now())?;
                    let echoed = header.split_to(self.method.salt_len());
                    if !bool::from(echoed[..].ct_eq(&self.request_salt)) {
                        return Err(Error::BadRequestSalt);
                    }
                    let first_len = header.get_u16() as usize;
                    self.read_state = ReadState::InitialPayload(first_len);
                }
                ReadState::InitialPayload(len) => {
                    if len == 0 {
                        self.read_state = ReadState::Streaming;
                        continue;
                    }
                    let reader = self.reader.as_mut().ok_or(Error::StreamClosed)?;
                    let Some(payload) = reader.open_fixed(&mut self.read_buf, len)? else {
                        return Ok(());
                    };
                    self.pending_plain.put_slice(&payload);
                    self.read_state = ReadState::Streaming;
                }
                ReadState::Streaming => {
                    let reader = self.reader.as_mut().ok_or(Error::StreamClosed)?;
                    let mut read_buf = std::mem::take(&mut self.read_buf);
                    let result = reader.decode(&mut read_buf, &mut self.pending_plain);
                    self.read_buf = read_buf;
                    result?;
                    return Ok(());
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ClientStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.pending_plain.is_empty() {
                let n = std::cmp::min(buf.remaining(), this.pending_plain.len());
                buf.put_slice(&this.pending_plain.split_to(n));
                return Poll::Ready(Ok(()));
            }
            // Reading before writing still requires the request header.
            if this.writer.is_none() {
                this.queue_request(&[]).map_err(io::Error::from)?;
            }
            if !this.write_buf.is_empty() {
                std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
            }

            let mut chunk = [0u8; 4096];
            let mut read_buf = ReadBuf::new(&mut chunk);
            std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                return Poll::Ready(Ok(()));
            }
            this.read_buf.extend_from_slice(filled);
            this.process_read_buf().map_err(io::Error::from)?;
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ClientStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let consumed = if this.writer.is_none() {
            this.queue_request(buf).map_err(io::Error::from)?
        } else {
            let writer = this
                .writer
                .as_mut()
                .ok_or_else(|| io::Error::from(Error::StreamClosed))?;
            writer
                .encode(buf, &mut this.write_buf)
                .map_err(io::Error::from)?;
            buf.len()
        };
        let _ = flush_buf(&mut this.inner, &mut this.write_buf, cx)?;
        Poll::Ready(Ok(consumed))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Shared server state: keys plus the salt replay pool.
pub struct Service {
    method: Method,
    psks: Vec<Vec<u8>>,
    salt_pool: SaltPool,
    clock: Arc<dyn Clock>,
}

impl Service {
    pub fn new(method: Method, psks: Vec<Vec<u8>>, clock: Arc<dyn Clock>) -> Result<Self> {
        let psks = method.reduce_keys(&psks)?;
        Ok(Service {
            method,
            psks,
            salt_pool: SaltPool::new(SALT_WINDOW),
            clock,
        })
    }

    /// Read and validate a client request, returning the stream, the
    /// target, and any early payload from the variable header.
    pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        mut inner: S,
    ) -> Result<(ServerStream<S>, Address, u16, BytesMut)> {
        let salt_len = self.method.salt_len();
        let mut salt = vec![0u8; salt_len];
        inner.read_exact(&mut salt).await?;

        for i in 0..self.psks.len() - 1 {
            let mut block = [0u8; 16];
            inner.read_exact(&mut block).await?;
            open_identity_header(self.method, &self.psks[i], &self.psks[i + 1], &salt, &block)?;
        }

        let user_psk = self.psks.last().cloned().unwrap_or_default();
        let subkey = session_subkey(&user_psk, &salt, self.method.key_len());
        let mut reader = ChunkReader::new(self.method.session_cipher(&subkey)?);

        let mut sealed_fixed = vec![0u8; FIXED_REQUEST_LEN + TAG_SIZE];
        inner.read_exact(&mut sealed_fixed).await?;
        let mut fixed = BytesMut::from(&reader.open_chunk(&sealed_fixed)?[..]);

        let header_type = fixed.get_u8();
        if header_type != HEADER_TYPE_CLIENT {
            return Err(Error::BadHeaderType(header_type));
        }
        let now = self.clock.now();
        check_timestamp(fixed.get_u64(), now)?;
        if !self.salt_pool.insert(&salt, now) {
            debug!("rejected repeated request salt");
            return Err(Error::SaltNotUnique);
        }

        let variable_len = fixed.get_u16() as usize;
        let mut sealed_variable = vec![0u8; variable_len + TAG_SIZE];
        inner.read_exact(&mut sealed_variable).await?;
        let mut variable = BytesMut::from(&reader.open_chunk(&sealed_variable)?[..]);

        let (address, port) = Address::read_socks(&mut variable)?;
        if variable.remaining() < 2 {
            return Err(Error::bad_header("Short variable header"));
        }
        let padding_len = variable.get_u16() as usize;
        if padding_len > variable.remaining() {
            return Err(Error::BadPadding);
        }
        variable.advance(padding_len);
        let early_payload = variable;

        trace!(
            target = %address.to_string_with_port(port),
            early = early_payload.len(),
            "accepted request"
        );

        Ok((
            ServerStream {
                inner,
                method: self.method,
                user_psk,
                request_salt: salt,
                clock: self.clock.clone(),
                writer: None,
                write_buf: BytesMut::new(),
                reader,
                read_buf: BytesMut::with_capacity(4096),
                pending_plain: BytesMut::new(),
            },
            address,
            port,
            early_payload,
        ))
    }
}

/// Server side of an accepted Shadowsocks-2022 TCP connection.
pub struct ServerStream<S> {
    inner: S,
    method: Method,
    user_psk: Vec<u8>,
    request_salt: Vec<u8>,
    clock: Arc<dyn Clock>,
    writer: Option<ChunkWriter>,
    write_buf: BytesMut,
    reader: ChunkReader,
    read_buf: BytesMut,
    pending_plain: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ServerStream<S> {
    /// Queue the response header, carrying the front of `payload` as
    /// the initial chunk. Returns bytes consumed.
    fn queue_response(&mut self, payload: &[u8]) -> Result<usize> {
        let mut response_salt = vec![0u8; self.method.salt_len()];
        getrandom::getrandom(&mut response_salt).map_err(|e| Error::key(e.to_string()))?;

        let subkey = session_subkey(&self.user_psk, &response_salt, self.method.key_len());
        let mut writer = ChunkWriter::new(self.method.session_cipher(&subkey)?);

        let first = std::cmp::min(payload.len(), MAX_PACKET_SIZE);
        let mut fixed = BytesMut::with_capacity(1 + 8 + self.request_salt.len() + 2);
        fixed.put_u8(HEADER_TYPE_SERVER);
        fixed.put_u64(self.clock.now());
        fixed.put_slice(&self.request_salt);
        fixed.put_u16(first as u16);

        self.write_buf.put_slice(&response_salt);
        let sealed_fixed = writer.seal_chunk(&fixed)?;
        self.write_buf.put_slice(&sealed_fixed);
        if first > 0 {
            let sealed_first = writer.seal_chunk(&payload[..first])?;
            self.write_buf.put_slice(&sealed_first);
        }
        self.writer = Some(writer);
        Ok(first)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ServerStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.pending_plain.is_empty() {
                let n = std::cmp::min(buf.remaining(), this.pending_plain.len());
                buf.put_slice(&this.pending_plain.split_to(n));
                return Poll::Ready(Ok(()));
            }
            let mut chunk = [0u8; 4096];
            let mut read_buf = ReadBuf::new(&mut chunk);
            std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                return Poll::Ready(Ok(()));
            }
            this.read_buf.extend_from_slice(filled);
            let mut read_buf = std::mem::take(&mut this.read_buf);
            let result = this.reader.decode(&mut read_buf, &mut this.pending_plain);
            this.read_buf = read_buf;
            result.map_err(io::Error::from)?;
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ServerStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let consumed = if this.writer.is_none() {
            this.queue_response(buf).map_err(io::Error::from)?
        } else {
            let writer = this
                .writer
                .as_mut()
                .ok_or_else(|| io::Error::from(Error::StreamClosed))?;
            writer
                .encode(buf, &mut this.write_buf)
                .map_err(io::Error::from)?;
            buf.len()
        };
        let _ = flush_buf(&mut this.inner, &mut this.write_buf, cx)?;
        Poll::Ready(Ok(consumed))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(1_700_000_000))
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let method = Method::Blake3Aes128Gcm;
        let psk = vec![0x42u8; 16];

        let mut client = ClientStream::new(
            client_io,
            method,
            vec![psk.clone()],
            Address::from("example.com"),
            80,
            clock(),
        )
        .unwrap();

        let service = Service::new(method, vec![psk], clock()).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, address, port, early) = service.accept(server_io).await.unwrap();
            assert_eq!(address, Address::from("example.com"));
            assert_eq!(port, 80);
            assert_eq!(&early[..], b"hello\n");
            stream.write_all(b"HI\n").await.unwrap();
            stream.flush().await.unwrap();

            let mut more = [0u8; 4];
            stream.read_exact(&mut more).await.unwrap();
            assert_eq!(&more, b"more");
        });

        client.write_all(b"hello\n").await.unwrap();
        client.flush().await.unwrap();
        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HI\n");

        client.write_all(b"more").await.unwrap();
        client.flush().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_identity_chain_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let method = Method::Blake3Aes256Gcm;
        let psks = vec![vec![0x01u8; 32], vec![0x02u8; 32]];

        let mut client = ClientStream::new(
            client_io,
            method,
            psks.clone(),
            Address::from("10.0.0.1"),
            443,
            clock(),
        )
        .unwrap();
        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();

        let service = Service::new(method, psks, clock()).unwrap();
        let (_, address, port, early) = service.accept(server_io).await.unwrap();
        assert_eq!(address, Address::from("10.0.0.1"));
        assert_eq!(port, 443);
        assert_eq!(&early[..], b"ping");
    }

    #[tokio::test]
    async fn test_replayed_request_rejected() {
        let method = Method::Blake3Aes128Gcm;
        let psk = vec![0x42u8; 16];
        let service = Service::new(method, vec![psk.clone()], clock()).unwrap();

        // Capture one full request off the wire.
        let (client_io, mut tap) = tokio::io::duplex(256 * 1024);
        let mut client = ClientStream::new(
            client_io,
            method,
            vec![psk],
            Address::from("example.com"),
            80,
            clock(),
        )
        .unwrap();
        client.write_all(b"hello\n").await.unwrap();
        client.flush().await.unwrap();
        drop(client);
        let mut recorded = Vec::new();
        tap.read_to_end(&mut recorded).await.unwrap();

        // First delivery is accepted.
        let (mut feed, server_io) = tokio::io::duplex(256 * 1024);
        feed.write_all(&recorded).await.unwrap();
        service.accept(server_io).await.unwrap();

        // Byte-identical replay trips the salt pool.
        let (mut feed, server_io) = tokio::io::duplex(256 * 1024);
        feed.write_all(&recorded).await.unwrap();
        assert!(matches!(
            service.accept(server_io).await,
            Err(Error::SaltNotUnique)
        ));
    }

    #[tokio::test]
    async fn test_stale_timestamp_rejected() {
        let method = Method::Blake3Aes128Gcm;
        let psk = vec![0x42u8; 16];

        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let mut client = ClientStream::new(
            client_io,
            method,
            vec![psk.clone()],
            Address::from("example.com"),
            80,
            Arc::new(ManualClock::new(1_700_000_000 - 120)),
        )
        .unwrap();
        client.write_all(b"hello\n").await.unwrap();
        client.flush().await.unwrap();

        let service = Service::new(method, vec![psk], clock()).unwrap();
        assert!(matches!(
            service.accept(server_io).await,
            Err(Error::BadTimestamp(_))
        ));
    }
}
