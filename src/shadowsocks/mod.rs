//! Legacy Shadowsocks AEAD stream codec
//!
//! The pre-2022 framing: `salt || chunk(address || payload) || chunk...`
//! with per-direction subkeys from HKDF-SHA1 and no replay protection.
//! The 2022 edition lives in [`crate::shadowsocks2022`].

use crate::chunk::{ChunkReader, ChunkWriter};
use crate::common::net::Address;
use crate::crypto::kdf::{evp_bytes_to_key, ss_subkey};
use crate::crypto::AeadCipher;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::trace;

/// Shadowsocks cipher type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherKind {
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-ietf-poly1305")]
    ChaCha20Poly1305,
}

impl CipherKind {
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    pub fn salt_size(&self) -> usize {
        self.key_size()
    }

    fn subkey_cipher(&self, subkey: &[u8]) -> Result<AeadCipher> {
        match self {
            CipherKind::Aes128Gcm => AeadCipher::aes_128_gcm(subkey),
            CipherKind::Aes256Gcm => AeadCipher::aes_256_gcm(subkey),
            CipherKind::ChaCha20Poly1305 => AeadCipher::chacha20_poly1305(subkey),
        }
    }

    /// Derive the master key from a password (EVP_BytesToKey)
    pub fn key_from_password(&self, password: &str) -> Vec<u8> {
        evp_bytes_to_key(password, self.key_size())
    }
}

impl TryFrom<&str> for CipherKind {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            _ => Err(Error::protocol(format!("Unsupported cipher: {}", s))),
        }
    }
}

/// One direction of a legacy AEAD stream: lazy salt on the first read
struct Half {
    cipher: CipherKind,
    master_key: Vec<u8>,
    reader: Option<ChunkReader>,
    read_buf: BytesMut,
    pending_plain: BytesMut,
}

impl Half {
    fn new(cipher: CipherKind, master_key: Vec<u8>) -> Self {
        Half {
            cipher,
            master_key,
            reader: None,
            read_buf: BytesMut::with_capacity(4096),
            pending_plain: BytesMut::new(),
        }
    }

    fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.read_buf.extend_from_slice(data);
        if self.reader.is_none() {
            let salt_size = self.cipher.salt_size();
            if self.read_buf.len() < salt_size {
                return Ok(());
            }
            let salt = self.read_buf.split_to(salt_size);
            let subkey = ss_subkey(&self.master_key, &salt)?;
            self.reader = Some(ChunkReader::new(self.cipher.subkey_cipher(&subkey)?));
        }
        if let Some(reader) = self.reader.as_mut() {
            let mut read_buf = std::mem::take(&mut self.read_buf);
            let result = reader.decode(&mut read_buf, &mut self.pending_plain);
            self.read_buf = read_buf;
            result?;
        }
        Ok(())
    }

    fn drain(&mut self, buf: &mut ReadBuf<'_>) -> bool {
        if self.pending_plain.is_empty() {
            return false;
        }
        let to_read = std::cmp::min(buf.remaining(), self.pending_plain.len());
        buf.put_slice(&self.pending_plain.split_to(to_read));
        true
    }
}

/// Client side of a legacy Shadowsocks AEAD connection.
///
/// The salt and the target address go out in front of the first payload
/// write, so a request with an empty body still reaches the server.
pub struct ClientStream<S> {
    inner: S,
    writer: ChunkWriter,
    recv: Half,
    header: BytesMut,
    write_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientStream<S> {
    pub fn new(inner: S, cipher: CipherKind, key: Vec<u8>, address: Address, port: u16) -> Result<Self> {
        let mut salt = vec![0u8; cipher.salt_size()];
        getrandom::getrandom(&mut salt).map_err(|e| Error::key(e.to_string()))?;

        let subkey = ss_subkey(&key, &salt)?;
        let mut writer = ChunkWriter::new(cipher.subkey_cipher(&subkey)?);

        let mut addr_bytes = BytesMut::with_capacity(address.len());
        address.write_socks(&mut addr_bytes, port)?;

        let mut header = BytesMut::with_capacity(salt.len() + addr_bytes.len() + 64);
        header.put_slice(&salt);
        writer.encode(&addr_bytes, &mut header)?;

        trace!(target = %address.to_string_with_port(port), "shadowsocks client stream");

        Ok(ClientStream {
            inner,
            writer,
            recv: Half::new(cipher, key),
            header,
            write_buf: BytesMut::new(),
        })
    }
}

fn poll_flush_buf<S: AsyncWrite + Unpin>(
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

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ClientStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.recv.drain(buf) {
                return Poll::Ready(Ok(()));
            }
            // The server will not speak until it has our salt and address.
            if !this.header.is_empty() {
                std::task::ready!(poll_flush_buf(&mut this.inner, &mut this.header, cx))?;
            }

            let mut chunk = [0u8; 4096];
            let mut read_buf = ReadBuf::new(&mut chunk);
            std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                return Poll::Ready(Ok(()));
            }
            this.recv.feed(filled).map_err(io::Error::from)?;
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
        std::task::ready!(poll_flush_buf(&mut this.inner, &mut this.header, cx))?;
        std::task::ready!(poll_flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.writer
            .encode(buf, &mut this.write_buf)
            .map_err(io::Error::from)?;
        // Best effort; leftovers flush on the next call.
        let _ = poll_flush_buf(&mut this.inner, &mut this.write_buf, cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        std::task::ready!(poll_flush_buf(&mut this.inner, &mut this.header, cx))?;
        std::task::ready!(poll_flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        std::task::ready!(poll_flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Server side of a legacy Shadowsocks AEAD connection.
///
/// Produced by [`accept`]; the response salt goes out in front of the
/// first payload write.
pub struct ServerStream<S> {
    inner: S,
    cipher: CipherKind,
    master_key: Vec<u8>,
    writer: Option<ChunkWriter>,
    recv: Half,
    write_buf: BytesMut,
}

/// Read the client salt and target address, returning the decrypted
/// stream plus any payload that arrived with the header.
pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
    mut inner: S,
    cipher: CipherKind,
    key: Vec<u8>,
) -> Result<(ServerStream<S>, Address, u16)> {
    let mut recv = Half::new(cipher, key.clone());

    // Pull data until the first chunk (salt + address) decodes.
    let mut chunk = [0u8; 4096];
    loop {
        let n = inner.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::bad_header("Connection closed during handshake"));
        }
        recv.feed(&chunk[..n])?;
        if !recv.pending_plain.is_empty() {
            break;
        }
    }

    let (address, port) = Address::read_socks(&mut recv.pending_plain)?;
    trace!(target = %address.to_string_with_port(port), "shadowsocks server accept");

    Ok((
        ServerStream {
            inner,
            cipher,
            master_key: key,
            writer: None,
            recv,
            write_buf: BytesMut::new(),
        },
        address,
        port,
    ))
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ServerStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.recv.drain(buf) {
                return Poll::Ready(Ok(()));
            }
            let mut chunk = [0u8; 4096];
            let mut read_buf = ReadBuf::new(&mut chunk);
            std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                return Poll::Ready(Ok(()));
            }
            this.recv.feed(filled).map_err(io::Error::from)?;
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
        std::task::ready!(poll_flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.writer.is_none() {
            let mut salt = vec![0u8; this.cipher.salt_size()];
            getrandom::getrandom(&mut salt)
                .map_err(|e| io::Error::other(e.to_string()))?;
            let subkey = ss_subkey(&this.master_key, &salt).map_err(io::Error::from)?;
            let cipher = this
                .cipher
                .subkey_cipher(&subkey)
                .map_err(io::Error::from)?;
            this.write_buf.put_slice(&salt);
            this.writer = Some(ChunkWriter::new(cipher));
        }

        if let Some(writer) = this.writer.as_mut() {
            writer
                .encode(buf, &mut this.write_buf)
                .map_err(io::Error::from)?;
        }
        let _ = poll_flush_buf(&mut this.inner, &mut this.write_buf, cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        std::task::ready!(poll_flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        std::task::ready!(poll_flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_cipher_kind_parse() {
        assert_eq!(
            CipherKind::try_from("aes-128-gcm").unwrap(),
            CipherKind::Aes128Gcm
        );
        assert_eq!(
            CipherKind::try_from("CHACHA20-IETF-POLY1305").unwrap(),
            CipherKind::ChaCha20Poly1305
        );
        assert!(CipherKind::try_from("rc4-md5").is_err());
    }

    #[test]
    fn test_key_from_password() {
        let key = CipherKind::Aes256Gcm.key_from_password("barfoo!");
        assert_eq!(key.len(), 32);
    }

    #[tokio::test]
    async fn test_client_server_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let cipher = CipherKind::Aes128Gcm;
        let key = cipher.key_from_password("test-password");

        let mut client = ClientStream::new(
            client_io,
            cipher,
            key.clone(),
            Address::from("example.com"),
            80,
        )
        .unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, address, port) = accept(server_io, cipher, key).await.unwrap();
            assert_eq!(address, Address::from("example.com"));
            assert_eq!(port, 80);

            let mut body = [0u8; 5];
            stream.read_exact(&mut body).await.unwrap();
            assert_eq!(&body, b"hello");
            stream.write_all(b"world").await.unwrap();
            stream.flush().await.unwrap();
        });

        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let cipher = CipherKind::Aes128Gcm;

        let mut client = ClientStream::new(
            client_io,
            cipher,
            cipher.key_from_password("right"),
            Address::from("example.com"),
            80,
        )
        .unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let result = accept(server_io, cipher, cipher.key_from_password("wrong")).await;
        assert!(result.is_err());
    }
}
