//! VMess stream halves and handshakes
//!
//! The AEAD handshake seals the request header under keys derived from
//! the account's cmd key, authenticated by an encrypted auth id. The
//! legacy handshake authenticates with HMAC-MD5 over the timestamp and
//! hides the header in AES-CFB. Either way the header carries the body
//! key material, so the body codec is independent of the handshake.

use super::chunk::{BodyCodec, Decoded};
use super::kdf::{
    kdf16, KDF_SALT_AEAD_RESP_HEADER_LEN_IV, KDF_SALT_AEAD_RESP_HEADER_LEN_KEY,
    KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_IV, KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_KEY,
    KDF_SALT_AUTH_ID_ENCRYPTION_KEY, KDF_SALT_AUTH_LEN, KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_IV,
    KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_KEY, KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_IV,
    KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_KEY,
};
use super::{
    fnv1a_hash, md5_16, resolve_security, sha256_first16, Command, ResolvedSecurity, Security,
    User, AUTH_ID_WINDOW, OPTION_AUTHENTICATED_LENGTH, OPTION_CHUNK_MASKING, OPTION_CHUNK_STREAM,
    OPTION_GLOBAL_PADDING, VERSION,
};
use crate::common::clock::Clock;
use crate::common::net::Address;
use crate::crypto::{AeadCipher, BlockCipher, CfbDecryptor, CfbEncryptor, TAG_SIZE};
use crate::replay::SaltPool;
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher as Crc32Hasher;
use fnv::FnvHashMap;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::rngs::OsRng;
use rand::RngCore;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

const SEALED_LEN_SIZE: usize = 2 + TAG_SIZE;
const MAX_RESPONSE_HEADER: usize = 4096;

type HmacMd5 = Hmac<Md5>;

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
        buf.advance(n);
    }
    Poll::Ready(Ok(()))
}

fn aes128_gcm_seal(key: &[u8; 16], nonce: &[u8], aad: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    AeadCipher::aes_128_gcm(key)?.seal(nonce, aad, plain)
}

fn aes128_gcm_open(key: &[u8; 16], nonce: &[u8], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    AeadCipher::aes_128_gcm(key)?.open(nonce, aad, sealed)
}

fn legacy_auth(id: &uuid::Uuid, timestamp: u64) -> [u8; 16] {
    let mut mac =
        <HmacMd5 as Mac>::new_from_slice(id.as_bytes()).unwrap_or_else(|_| unreachable!());
    mac.update(&timestamp.to_be_bytes());
    let out = mac.finalize().into_bytes();
    let mut auth = [0u8; 16];
    auth.copy_from_slice(&out);
    auth
}

/// IV for the legacy request header cipher: md5 of the timestamp
/// repeated four times.
fn legacy_header_iv(timestamp: u64) -> [u8; 16] {
    use md5::Digest;
    let mut hasher = Md5::new();
    for _ in 0..4 {
        Digest::update(&mut hasher, timestamp.to_be_bytes());
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Encrypted auth id: timestamp, random, crc32, AES-ECB under a key
/// derived from the cmd key.
fn create_auth_id(cmd_key: &[u8; 16], timestamp: u64) -> Result<[u8; 16]> {
    let mut block = [0u8; 16];
    block[..8].copy_from_slice(&timestamp.to_be_bytes());
    OsRng.fill_bytes(&mut block[8..12]);

    let mut crc = Crc32Hasher::new();
    crc.update(&block[..12]);
    block[12..16].copy_from_slice(&crc.finalize().to_be_bytes());

    let auth_key = kdf16(cmd_key, KDF_SALT_AUTH_ID_ENCRYPTION_KEY, &[]);
    BlockCipher::new(&auth_key)?.encrypt_block(&mut block);
    Ok(block)
}

/// Try to open an auth id with one account's key. Returns the embedded
/// timestamp on success, `None` when the checksum does not line up.
fn open_auth_id(cmd_key: &[u8; 16], auth_id: &[u8; 16]) -> Result<Option<u64>> {
    let auth_key = kdf16(cmd_key, KDF_SALT_AUTH_ID_ENCRYPTION_KEY, &[]);
    let mut block = *auth_id;
    BlockCipher::new(&auth_key)?.decrypt_block(&mut block);

    let mut crc = Crc32Hasher::new();
    crc.update(&block[..12]);
    if crc.finalize().to_be_bytes() != block[12..16] {
        return Ok(None);
    }
    Ok(Some(u64::from_be_bytes(block[..8].try_into().unwrap())))
}

/// Decoded request header, shared by both handshake flavours
#[derive(Debug, Clone)]
pub struct Request {
    pub command: Command,
    /// Absent for mux requests
    pub address: Option<Address>,
    pub port: u16,
    pub(crate) security: ResolvedSecurity,
    pub(crate) option: u8,
    pub(crate) body_key: [u8; 16],
    pub(crate) body_nonce: [u8; 16],
    pub(crate) response_id: u8,
}

impl Request {
    fn encode(&self) -> Result<Vec<u8>> {
        let padding_len = (OsRng.next_u32() % 16) as u8;
        let mut header = BytesMut::new();
        header.put_u8(VERSION);
        header.put_slice(&self.body_nonce);
        header.put_slice(&self.body_key);
        header.put_u8(self.response_id);
        header.put_u8(self.option);
        header.put_u8((padding_len << 4) | (self.security.protocol_byte() & 0x0f));
        header.put_u8(0);
        header.put_u8(self.command.protocol_byte());
        if self.command.has_address() {
            let address = self
                .address
                .as_ref()
                .ok_or_else(|| Error::bad_header("Missing destination"))?;
            address.write_vmess_port_addr(&mut header, self.port)?;
        }
        if padding_len > 0 {
            let mut padding = vec![0u8; padding_len as usize];
            OsRng.fill_bytes(&mut padding);
            header.put_slice(&padding);
        }
        header.put_u32(fnv1a_hash(&header));
        Ok(header.to_vec())
    }

    fn decode(plain: &[u8]) -> Result<Self> {
        if plain.len() < 4 {
            return Err(Error::bad_header("Short request header"));
        }
        let (body, checksum) = plain.split_at(plain.len() - 4);
        if fnv1a_hash(body) != u32::from_be_bytes(checksum.try_into().unwrap()) {
            return Err(Error::BadChecksum);
        }

        let mut buf = body;
        if buf.remaining() < 1 + 16 + 16 + 5 {
            return Err(Error::bad_header("Short request header"));
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(Error::BadVersion(version));
        }
        let mut body_nonce = [0u8; 16];
        buf.copy_to_slice(&mut body_nonce);
        let mut body_key = [0u8; 16];
        buf.copy_to_slice(&mut body_key);
        let response_id = buf.get_u8();
        let option = buf.get_u8();
        let pad_sec = buf.get_u8();
        let security = ResolvedSecurity::from_byte(pad_sec & 0x0f)?;
        let _reserved = buf.get_u8();
        let command = Command::from_byte(buf.get_u8())?;

        let (address, port) = if command.has_address() {
            let (addr, port) = Address::read_vmess_port_addr(&mut buf)?;
            (Some(addr), port)
        } else {
            (None, 0)
        };

        let padding_len = (pad_sec >> 4) as usize;
        if buf.remaining() != padding_len {
            return Err(Error::BadPadding);
        }

        Ok(Request {
            command,
            address,
            port,
            security,
            option,
            body_key,
            body_nonce,
            response_id,
        })
    }
}

/// Client-side knobs for a VMess connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub security: Security,
    pub chunk_masking: bool,
    pub global_padding: bool,
    pub authenticated_length: bool,
    /// Use the legacy HMAC-MD5 handshake with AES-CFB bodies
    pub legacy: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            security: Security::Auto,
            chunk_masking: true,
            global_padding: false,
            authenticated_length: false,
            legacy: false,
        }
    }
}

impl ClientConfig {
    fn resolved(&self) -> ResolvedSecurity {
        if self.legacy {
            ResolvedSecurity::Legacy
        } else {
            resolve_security(self.security)
        }
    }

    fn option(&self, security: ResolvedSecurity) -> u8 {
        if security == ResolvedSecurity::Zero {
            return 0;
        }
        let mut option = OPTION_CHUNK_STREAM;
        if self.chunk_masking {
            option |= OPTION_CHUNK_MASKING;
        }
        if self.global_padding {
            option |= OPTION_GLOBAL_PADDING;
        }
        if self.authenticated_length && security.is_aead() {
            option |= OPTION_AUTHENTICATED_LENGTH;
        }
        option
    }
}

enum BodyMode {
    Framed(BodyCodec),
    /// Security "zero": bytes pass through untouched
    Raw,
}

enum ResponseState {
    /// AEAD: waiting for the sealed length
    AeadLen,
    /// AEAD: waiting for the sealed header of known ciphertext size
    AeadHeader(usize),
    /// Legacy: waiting for the 4-byte CFB header
    Legacy,
    /// Legacy: discarding the trailing command of known size
    LegacyCommand(usize),
    Done,
}

/// Client side of a VMess connection.
pub struct ClientStream<S> {
    inner: S,
    enc: BodyMode,
    dec: BodyMode,
    write_buf: BytesMut,
    read_buf: BytesMut,
    pending_plain: BytesMut,
    response_state: ResponseState,
    response_key: [u8; 16],
    response_nonce: [u8; 16],
    response_id: u8,
    cfb_write: Option<CfbEncryptor>,
    cfb_read: Option<CfbDecryptor>,
    read_eof: bool,
    sent_eof: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientStream<S> {
    /// Build the stream and queue the request header. Nothing touches
    /// the transport until the first poll.
    pub fn new(
        inner: S,
        user: &User,
        config: &ClientConfig,
        command: Command,
        address: Option<Address>,
        port: u16,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let security = config.resolved();
        let option = config.option(security);

        let mut body_key = [0u8; 16];
        let mut body_nonce = [0u8; 16];
        OsRng.fill_bytes(&mut body_key);
        OsRng.fill_bytes(&mut body_nonce);
        let response_id = (OsRng.next_u32() & 0xff) as u8;

        let request = Request {
            command,
            address,
            port,
            security,
            option,
            body_key,
            body_nonce,
            response_id,
        };
        let header = request.encode()?;
        let timestamp = clock.now();

        let mut write_buf = BytesMut::new();
        let (response_key, response_nonce, cfb_write, cfb_read) = if config.legacy {
            let ids = user.legacy_ids();
            let id = ids[OsRng.next_u32() as usize % ids.len()];
            write_buf.put_slice(&legacy_auth(&id, timestamp));

            let mut sealed = header;
            CfbEncryptor::new(&md5_16(user.cmd_key()), &legacy_header_iv(timestamp))
                .apply(&mut sealed);
            write_buf.put_slice(&sealed);

            let response_key = md5_16(&body_key);
            let response_nonce = md5_16(&body_nonce);
            (
                response_key,
                response_nonce,
                Some(CfbEncryptor::new(&body_key, &body_nonce)),
                Some(CfbDecryptor::new(&response_key, &response_nonce)),
            )
        } else {
            let auth_id = create_auth_id(user.cmd_key(), timestamp)?;
            let mut connection_nonce = [0u8; 8];
            OsRng.fill_bytes(&mut connection_nonce);

            let header_len = u16::try_from(header.len())
                .map_err(|_| Error::bad_header("Request header too large"))?;
            let len_key = kdf16(
                user.cmd_key(),
                KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_KEY,
                &[&auth_id, &connection_nonce],
            );
            let len_iv = kdf16(
                user.cmd_key(),
                KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_IV,
                &[&auth_id, &connection_nonce],
            );
            let sealed_len =
                aes128_gcm_seal(&len_key, &len_iv[..12], &auth_id, &header_len.to_be_bytes())?;

            let hdr_key = kdf16(
                user.cmd_key(),
                KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_KEY,
                &[&auth_id, &connection_nonce],
            );
            let hdr_iv = kdf16(
                user.cmd_key(),
                KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_IV,
                &[&auth_id, &connection_nonce],
            );
            let sealed_header = aes128_gcm_seal(&hdr_key, &hdr_iv[..12], &auth_id, &header)?;

            write_buf.put_slice(&auth_id);
            write_buf.put_slice(&sealed_len);
            write_buf.put_slice(&connection_nonce);
            write_buf.put_slice(&sealed_header);

            (
                sha256_first16(&body_key),
                sha256_first16(&body_nonce),
                None,
                None,
            )
        };

        let auth_len_key = kdf16(&body_key, KDF_SALT_AUTH_LEN, &[]);
        let enc = if option & OPTION_CHUNK_STREAM != 0 {
            BodyMode::Framed(BodyCodec::new(
                security,
                &body_key,
                &body_nonce,
                option,
                &auth_len_key,
            )?)
        } else {
            BodyMode::Raw
        };
        let dec = if option & OPTION_CHUNK_STREAM != 0 {
            BodyMode::Framed(BodyCodec::new(
                security,
                &response_key,
                &response_nonce,
                option,
                &auth_len_key,
            )?)
        } else {
            BodyMode::Raw
        };

        let response_state = if config.legacy {
            ResponseState::Legacy
        } else {
            ResponseState::AeadLen
        };

        trace!(command = ?command, security = ?security, option, "vmess client stream");

        Ok(ClientStream {
            inner,
            enc,
            dec,
            write_buf,
            read_buf: BytesMut::with_capacity(4096),
            pending_plain: BytesMut::new(),
            response_state,
            response_key,
            response_nonce,
            response_id,
            cfb_write,
            cfb_read,
            read_eof: false,
            sent_eof: false,
        })
    }

    fn process_response_header(&mut self) -> Result<()> {
        loop {
            match self.response_state {
                ResponseState::AeadLen => {
                    if self.read_buf.len() < SEALED_LEN_SIZE {
                        return Ok(());
                    }
                    let sealed = self.read_buf.split_to(SEALED_LEN_SIZE);
                    let len_key = kdf16(&self.response_key, KDF_SALT_AEAD_RESP_HEADER_LEN_KEY, &[]);
                    let len_iv = kdf16(&self.response_nonce, KDF_SALT_AEAD_RESP_HEADER_LEN_IV, &[]);
                    let plain = aes128_gcm_open(&len_key, &len_iv[..12], &[], &sealed)?;
                    if plain.len() != 2 {
                        return Err(Error::bad_header("Bad response length"));
                    }
                    let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
                    if len < 4 || len > MAX_RESPONSE_HEADER {
                        return Err(Error::bad_header(format!(
                            "Unexpected response header length: {}",
                            len
                        )));
                    }
                    self.response_state = ResponseState::AeadHeader(len + TAG_SIZE);
                }
                ResponseState::AeadHeader(sealed_len) => {
                    if self.read_buf.len() < sealed_len {
                        return Ok(());
                    }
                    let sealed = self.read_buf.split_to(sealed_len);
                    let hdr_key = kdf16(
                        &self.response_key,
                        KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_KEY,
                        &[],
                    );
                    let hdr_iv = kdf16(
                        &self.response_nonce,
                        KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_IV,
                        &[],
                    );
                    let plain = aes128_gcm_open(&hdr_key, &hdr_iv[..12], &[], &sealed)?;
                    self.validate_response(&plain)?;
                    self.response_state = ResponseState::Done;
                    return Ok(());
                }
                ResponseState::Legacy => {
                    if self.read_buf.len() < 4 {
                        return Ok(());
                    }
                    let header = self.read_buf.split_to(4);
                    self.validate_response(&header)?;
                    let cmd_len = header[3] as usize;
                    if cmd_len == 0 {
                        self.response_state = ResponseState::Done;
                        return Ok(());
                    }
                    self.response_state = ResponseState::LegacyCommand(cmd_len);
                }
                ResponseState::LegacyCommand(cmd_len) => {
                    if self.read_buf.len() < cmd_len {
                        return Ok(());
                    }
                    // Dynamic-port commands are ignored.
                    self.read_buf.advance(cmd_len);
                    self.response_state = ResponseState::Done;
                    return Ok(());
                }
                ResponseState::Done => return Ok(()),
            }
        }
    }

    fn validate_response(&self, plain: &[u8]) -> Result<()> {
        if plain.len() < 4 {
            return Err(Error::bad_header("Short response header"));
        }
        if plain[0] != self.response_id {
            return Err(Error::bad_header("Response id mismatch"));
        }
        Ok(())
    }

    fn process_body(&mut self) -> Result<()> {
        match &mut self.dec {
            BodyMode::Framed(codec) => {
                let mut read_buf = std::mem::take(&mut self.read_buf);
                let result = codec.decode(&mut read_buf, &mut self.pending_plain);
                self.read_buf = read_buf;
                if matches!(result?, Decoded::Eof) {
                    self.read_eof = true;
                }
            }
            BodyMode::Raw => {
                let bytes = self.read_buf.split();
                self.pending_plain.unsplit(bytes);
            }
        }
        Ok(())
    }

    fn queue_payload(&mut self, payload: &[u8]) -> Result<()> {
        let mut staged = BytesMut::new();
        match &mut self.enc {
            BodyMode::Framed(codec) => codec.encode(payload, &mut staged)?,
            BodyMode::Raw => staged.put_slice(payload),
        }
        if let Some(cfb) = self.cfb_write.as_mut() {
            cfb.apply(&mut staged);
        }
        self.write_buf.unsplit(staged);
        Ok(())
    }

    fn queue_eof(&mut self) -> Result<()> {
        if self.sent_eof {
            return Ok(());
        }
        self.sent_eof = true;
        let mut staged = BytesMut::new();
        if let BodyMode::Framed(codec) = &mut self.enc {
            codec.encode_eof(&mut staged)?;
        }
        if let Some(cfb) = self.cfb_write.as_mut() {
            cfb.apply(&mut staged);
        }
        self.write_buf.unsplit(staged);
        Ok(())
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
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }
            // The server answers only after seeing the request header.
            if !this.write_buf.is_empty() {
                std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
            }

            let mut chunk = [0u8; 16384];
            let mut read_buf = ReadBuf::new(&mut chunk);
            std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled_mut();
            if filled.is_empty() {
                return Poll::Ready(Ok(()));
            }
            if let Some(cfb) = this.cfb_read.as_mut() {
                cfb.apply(filled);
            }
            this.read_buf.extend_from_slice(filled);

            this.process_response_header().map_err(io::Error::from)?;
            if matches!(this.response_state, ResponseState::Done) {
                this.process_body().map_err(io::Error::from)?;
            }
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
        this.queue_payload(buf).map_err(io::Error::from)?;
        let _ = flush_buf(&mut this.inner, &mut this.write_buf, cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.queue_eof().map_err(io::Error::from)?;
        std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Server-side account registry plus the auth replay filter.
pub struct Service {
    users: Vec<User>,
    replay: SaltPool,
    clock: Arc<dyn Clock>,
}

impl Service {
    pub fn new(users: Vec<User>, clock: Arc<dyn Clock>) -> Self {
        Service {
            users,
            replay: SaltPool::new(AUTH_ID_WINDOW),
            clock,
        }
    }

    /// Read and authenticate a request, returning the stream half and
    /// the decoded request.
    pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        mut inner: S,
    ) -> Result<(ServerStream<S>, Request)> {
        let now = self.clock.now();
        let mut auth = [0u8; 16];
        inner.read_exact(&mut auth).await?;

        // AEAD first: an auth id whose checksum opens under some
        // account key.
        for user in &self.users {
            let Some(timestamp) = open_auth_id(user.cmd_key(), &auth)? else {
                continue;
            };
            if now.abs_diff(timestamp) > AUTH_ID_WINDOW {
                return Err(Error::BadTimestamp(timestamp));
            }
            if !self.replay.insert(&auth, now) {
                debug!("rejected repeated auth id");
                return Err(Error::SaltNotUnique);
            }
            return self.accept_aead(inner, user.clone(), auth).await;
        }

        // Legacy: the 16 bytes are an HMAC over a nearby timestamp.
        let table = self.legacy_auth_table(now);
        if let Some((user_index, timestamp)) = table.get(&auth).copied() {
            if !self.replay.insert(&auth, now) {
                debug!("rejected repeated legacy auth");
                return Err(Error::SaltNotUnique);
            }
            let user = self.users[user_index].clone();
            return self.accept_legacy(inner, user, timestamp).await;
        }

        Err(Error::bad_header("Unknown auth id"))
    }

    /// HMAC table over the tolerated timestamp window, rebuilt per
    /// legacy handshake. Accounts with large alter ids pay for it; the
    /// AEAD path never gets here.
    fn legacy_auth_table(&self, now: u64) -> FnvHashMap<[u8; 16], (usize, u64)> {
        let mut table = FnvHashMap::default();
        for (user_index, user) in self.users.iter().enumerate() {
            for id in user.legacy_ids() {
                for timestamp in now.saturating_sub(AUTH_ID_WINDOW)..=now + AUTH_ID_WINDOW {
                    table.insert(legacy_auth(&id, timestamp), (user_index, timestamp));
                }
            }
        }
        table
    }

    async fn accept_aead<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        mut inner: S,
        user: User,
        auth_id: [u8; 16],
    ) -> Result<(ServerStream<S>, Request)> {
        let mut sealed_len = [0u8; SEALED_LEN_SIZE];
        inner.read_exact(&mut sealed_len).await?;
        let mut connection_nonce = [0u8; 8];
        inner.read_exact(&mut connection_nonce).await?;

        let len_key = kdf16(
            user.cmd_key(),
            KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_KEY,
            &[&auth_id, &connection_nonce],
        );
        let len_iv = kdf16(
            user.cmd_key(),
            KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_IV,
            &[&auth_id, &connection_nonce],
        );
        let plain_len = aes128_gcm_open(&len_key, &len_iv[..12], &auth_id, &sealed_len)?;
        if plain_len.len() != 2 {
            return Err(Error::bad_header("Bad request header length"));
        }
        let header_len = u16::from_be_bytes([plain_len[0], plain_len[1]]) as usize;

        let mut sealed_header = vec![0u8; header_len + TAG_SIZE];
        inner.read_exact(&mut sealed_header).await?;
        let hdr_key = kdf16(
            user.cmd_key(),
            KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_KEY,
            &[&auth_id, &connection_nonce],
        );
        let hdr_iv = kdf16(
            user.cmd_key(),
            KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_IV,
            &[&auth_id, &connection_nonce],
        );
        let header = aes128_gcm_open(&hdr_key, &hdr_iv[..12], &auth_id, &sealed_header)?;
        let request = Request::decode(&header)?;

        let stream = ServerStream::new(inner, &request, false)?;
        Ok((stream, request))
    }

    async fn accept_legacy<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        mut inner: S,
        user: User,
        timestamp: u64,
    ) -> Result<(ServerStream<S>, Request)> {
        let mut cfb = CfbDecryptor::new(&md5_16(user.cmd_key()), &legacy_header_iv(timestamp));
        let mut header = BytesMut::new();

        // Fixed prefix through the command byte: version, body nonce,
        // body key, response id, option, padding/security, reserved,
        // command.
        let mut fixed = [0u8; 38];
        inner.read_exact(&mut fixed).await?;
        cfb.apply(&mut fixed);
        header.put_slice(&fixed);

        let version = fixed[0];
        if version != VERSION {
            return Err(Error::BadVersion(version));
        }
        let pad_sec = fixed[35];
        let command = Command::from_byte(fixed[37])?;
        let addr_tail = if command.has_address() {
            // Port and address type follow the command.
            let mut port_tag = [0u8; 3];
            inner.read_exact(&mut port_tag).await?;
            cfb.apply(&mut port_tag);
            header.put_slice(&port_tag);
            match port_tag[2] {
                0x01 => 4,
                0x03 => 16,
                0x02 => {
                    let mut len = [0u8; 1];
                    inner.read_exact(&mut len).await?;
                    cfb.apply(&mut len);
                    header.put_slice(&len);
                    len[0] as usize
                }
                t => return Err(Error::bad_header(format!("Unknown address type: {}", t))),
            }
        } else {
            0
        };

        let padding_len = (pad_sec >> 4) as usize;
        let mut rest = vec![0u8; addr_tail + padding_len + 4];
        inner.read_exact(&mut rest).await?;
        cfb.apply(&mut rest);
        header.put_slice(&rest);

        let request = Request::decode(&header)?;
        let stream = ServerStream::new(inner, &request, true)?;
        Ok((stream, request))
    }
}

/// Server side of an accepted VMess connection.
pub struct ServerStream<S> {
    inner: S,
    enc: BodyMode,
    dec: BodyMode,
    write_buf: BytesMut,
    read_buf: BytesMut,
    pending_plain: BytesMut,
    response_queued: bool,
    response_header: BytesMut,
    cfb_write: Option<CfbEncryptor>,
    cfb_read: Option<CfbDecryptor>,
    read_eof: bool,
    sent_eof: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ServerStream<S> {
    fn new(inner: S, request: &Request, legacy: bool) -> Result<Self> {
        let (response_key, response_nonce) = if legacy {
            (md5_16(&request.body_key), md5_16(&request.body_nonce))
        } else {
            (
                sha256_first16(&request.body_key),
                sha256_first16(&request.body_nonce),
            )
        };

        let auth_len_key = kdf16(&request.body_key, KDF_SALT_AUTH_LEN, &[]);
        let framed = request.option & OPTION_CHUNK_STREAM != 0;
        let dec = if framed {
            BodyMode::Framed(BodyCodec::new(
                request.security,
                &request.body_key,
                &request.body_nonce,
                request.option,
                &auth_len_key,
            )?)
        } else {
            BodyMode::Raw
        };
        let enc = if framed {
            BodyMode::Framed(BodyCodec::new(
                request.security,
                &response_key,
                &response_nonce,
                request.option,
                &auth_len_key,
            )?)
        } else {
            BodyMode::Raw
        };

        // Response header: {id, option, command, command length}
        let plain = [request.response_id, request.option, 0, 0];
        let mut response_header = BytesMut::new();
        let (cfb_write, cfb_read) = if legacy {
            let mut cfb = CfbEncryptor::new(&response_key, &response_nonce);
            let mut sealed = plain;
            cfb.apply(&mut sealed);
            response_header.put_slice(&sealed);
            (
                Some(cfb),
                Some(CfbDecryptor::new(&request.body_key, &request.body_nonce)),
            )
        } else {
            let len_key = kdf16(&response_key, KDF_SALT_AEAD_RESP_HEADER_LEN_KEY, &[]);
            let len_iv = kdf16(&response_nonce, KDF_SALT_AEAD_RESP_HEADER_LEN_IV, &[]);
            let sealed_len =
                aes128_gcm_seal(&len_key, &len_iv[..12], &[], &4u16.to_be_bytes())?;
            let hdr_key = kdf16(&response_key, KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_KEY, &[]);
            let hdr_iv = kdf16(&response_nonce, KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_IV, &[]);
            let sealed_header = aes128_gcm_seal(&hdr_key, &hdr_iv[..12], &[], &plain)?;
            response_header.put_slice(&sealed_len);
            response_header.put_slice(&sealed_header);
            (None, None)
        };

        Ok(ServerStream {
            inner,
            enc,
            dec,
            write_buf: BytesMut::new(),
            read_buf: BytesMut::with_capacity(4096),
            pending_plain: BytesMut::new(),
            response_queued: false,
            response_header,
            cfb_write,
            cfb_read,
            read_eof: false,
            sent_eof: false,
        })
    }

    fn queue_response_header(&mut self) {
        if !self.response_queued {
            self.response_queued = true;
            let header = self.response_header.split();
            self.write_buf.unsplit(header);
        }
    }

    fn queue_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.queue_response_header();
        let mut staged = BytesMut::new();
        match &mut self.enc {
            BodyMode::Framed(codec) => codec.encode(payload, &mut staged)?,
            BodyMode::Raw => staged.put_slice(payload),
        }
        if let Some(cfb) = self.cfb_write.as_mut() {
            cfb.apply(&mut staged);
        }
        self.write_buf.unsplit(staged);
        Ok(())
    }

    fn process_body(&mut self) -> Result<()> {
        match &mut self.dec {
            BodyMode::Framed(codec) => {
                let mut read_buf = std::mem::take(&mut self.read_buf);
                let result = codec.decode(&mut read_buf, &mut self.pending_plain);
                self.read_buf = read_buf;
                if matches!(result?, Decoded::Eof) {
                    self.read_eof = true;
                }
            }
            BodyMode::Raw => {
                let bytes = self.read_buf.split();
                self.pending_plain.unsplit(bytes);
            }
        }
        Ok(())
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
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }

            let mut chunk = [0u8; 16384];
            let mut read_buf = ReadBuf::new(&mut chunk);
            std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled_mut();
            if filled.is_empty() {
                return Poll::Ready(Ok(()));
            }
            if let Some(cfb) = this.cfb_read.as_mut() {
                cfb.apply(filled);
            }
            this.read_buf.extend_from_slice(filled);
            this.process_body().map_err(io::Error::from)?;
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
        this.queue_payload(buf).map_err(io::Error::from)?;
        let _ = flush_buf(&mut this.inner, &mut this.write_buf, cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.sent_eof {
            this.sent_eof = true;
            this.queue_response_header();
            let mut staged = BytesMut::new();
            if let BodyMode::Framed(codec) = &mut this.enc {
                codec.encode_eof(&mut staged).map_err(io::Error::from)?;
            }
            if let Some(cfb) = this.cfb_write.as_mut() {
                cfb.apply(&mut staged);
            }
            this.write_buf.unsplit(staged);
        }
        std::task::ready!(flush_buf(&mut this.inner, &mut this.write_buf, cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
