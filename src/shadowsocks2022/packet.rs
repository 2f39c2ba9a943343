//! Shadowsocks-2022 UDP packet codec
//!
//! Sans-io: callers move datagrams between a socket and the
//! encode/decode methods here. AES methods carry a 16-byte packet
//! header (session id, packet id) encrypted as a single ECB block,
//! with the body sealed under a per-session subkey and the plaintext
//! header bytes as nonce. The ChaCha method instead seals the whole
//! structure under the user key with a random 24-byte XChaCha nonce.
//!
//! Packet ids feed a sliding-window replay filter per session. Remote
//! session rotation is rate limited: a peer announcing fresh session
//! ids faster than once a minute is cut off.

use super::{check_timestamp, Method, HEADER_TYPE_CLIENT, HEADER_TYPE_SERVER, MAX_PADDING_LENGTH};
use crate::common::clock::Clock;
use crate::common::net::Address;
use crate::crypto::kdf::{psk_hash, session_subkey};
use crate::crypto::{AeadCipher, BlockCipher};
use crate::replay::SlidingWindow;
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use std::num::NonZeroUsize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, trace};

/// Minimum seconds between remote session changes
const SESSION_ROTATION_INTERVAL: u64 = 60;

/// Server-side session table capacity
const DEFAULT_MAX_SESSIONS: usize = 1024;

const PACKET_HEADER_LEN: usize = 16;
const XCHACHA_NONCE_LEN: usize = 24;

fn random_u64() -> Result<u64> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).map_err(|e| Error::key(e.to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

/// DNS datagrams get padded; everything else is left alone.
fn padding_len(port: u16, payload_len: usize) -> usize {
    if port == 53 && payload_len < MAX_PADDING_LENGTH {
        rand::thread_rng().gen_range(1..MAX_PADDING_LENGTH)
    } else {
        0
    }
}

fn put_padding(buf: &mut BytesMut, len: usize) {
    buf.put_u16(len as u16);
    buf.resize(buf.len() + len, 0);
}

/// One remote (receive-direction) session
struct RemoteSession {
    id: u64,
    cipher: AeadCipher,
    window: SlidingWindow,
}

/// Client half of a Shadowsocks-2022 UDP conversation.
pub struct PacketClient {
    method: Method,
    psks: Vec<Vec<u8>>,
    session_id: u64,
    packet_id: u64,
    send_cipher: AeadCipher,
    /// ECB cipher over the outgoing packet header, keyed by the first
    /// hop's key. AES methods only.
    header_block: Option<BlockCipher>,
    /// ECB cipher over incoming packet headers, keyed by the user key.
    recv_block: Option<BlockCipher>,
    clock: Arc<dyn Clock>,
    remote: Option<RemoteSession>,
    last_remote: Option<RemoteSession>,
    last_rotation: u64,
}

impl PacketClient {
    pub fn new(method: Method, psks: Vec<Vec<u8>>, clock: Arc<dyn Clock>) -> Result<Self> {
        let psks = method.reduce_keys(&psks)?;
        let user_psk = psks.last().cloned().unwrap_or_default();
        let session_id = random_u64()?;

        let (send_cipher, header_block, recv_block) = if method.is_aes() {
            let subkey = session_subkey(&user_psk, &session_id.to_be_bytes(), method.key_len());
            (
                method.session_cipher(&subkey)?,
                Some(BlockCipher::new(&psks[0])?),
                Some(BlockCipher::new(&user_psk)?),
            )
        } else {
            (AeadCipher::xchacha20_poly1305(&user_psk)?, None, None)
        };

        Ok(PacketClient {
            method,
            psks,
            session_id,
            packet_id: u64::MAX,
            send_cipher,
            header_block,
            recv_block,
            clock,
            remote: None,
            last_remote: None,
            last_rotation: 0,
        })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Encode one datagram bound for `address:port`.
    pub fn encode(
        &mut self,
        address: &Address,
        port: u16,
        payload: &[u8],
        out: &mut BytesMut,
    ) -> Result<()> {
        self.packet_id = self.packet_id.wrapping_add(1);
        let pad = padding_len(port, payload.len());

        if self.method.is_aes() {
            let mut header = [0u8; PACKET_HEADER_LEN];
            header[..8].copy_from_slice(&self.session_id.to_be_bytes());
            header[8..].copy_from_slice(&self.packet_id.to_be_bytes());

            let mut body = BytesMut::with_capacity(
                1 + 8 + 2 + pad + address.len() + payload.len(),
            );
            body.put_u8(HEADER_TYPE_CLIENT);
            body.put_u64(self.clock.now());
            put_padding(&mut body, pad);
            address.write_socks(&mut body, port)?;
            body.put_slice(payload);

            let sealed = self.send_cipher.seal(&header[4..16], &[], &body)?;

            let mut enc_header = header;
            if let Some(block) = self.header_block.as_ref() {
                block.encrypt_block(&mut enc_header);
            }
            out.put_slice(&enc_header);
            for i in 0..self.psks.len() - 1 {
                let mut identity = psk_hash(&self.psks[i + 1]);
                for (b, h) in identity.iter_mut().zip(header.iter()) {
                    *b ^= h;
                }
                BlockCipher::new(&self.psks[i])?.encrypt_block(&mut identity);
                out.put_slice(&identity);
            }
            out.put_slice(&sealed);
        } else {
            let mut nonce = [0u8; XCHACHA_NONCE_LEN];
            getrandom::getrandom(&mut nonce).map_err(|e| Error::key(e.to_string()))?;

            let mut body = BytesMut::with_capacity(
                16 + 1 + 8 + 2 + pad + address.len() + payload.len(),
            );
            body.put_u64(self.session_id);
            body.put_u64(self.packet_id);
            body.put_u8(HEADER_TYPE_CLIENT);
            body.put_u64(self.clock.now());
            put_padding(&mut body, pad);
            address.write_socks(&mut body, port)?;
            body.put_slice(payload);

            let sealed = self.send_cipher.seal(&nonce, &[], &body)?;
            out.put_slice(&nonce);
            out.put_slice(&sealed);
        }
        Ok(())
    }

    /// Locate or establish the remote session for `id`. Enforces the
    /// rotation rate limit.
    fn remote_session(&mut self, id: u64, now: u64) -> Result<&mut RemoteSession> {
        // Borrow-checker friendly: decide first, then fetch.
        let known = matches!(&self.remote, Some(s) if s.id == id);
        let is_last = matches!(&self.last_remote, Some(s) if s.id == id);

        if known {
            return Ok(self.remote.as_mut().ok_or(Error::StreamClosed)?);
        }
        if is_last {
            return Ok(self.last_remote.as_mut().ok_or(Error::StreamClosed)?);
        }

        if self.remote.is_some() && now.saturating_sub(self.last_rotation) < SESSION_ROTATION_INTERVAL {
            debug!(session = id, "remote session rotated too fast");
            return Err(Error::TooManyServerSessions);
        }

        let user_psk = self.psks.last().cloned().unwrap_or_default();
        let cipher = if self.method.is_aes() {
            let subkey = session_subkey(&user_psk, &id.to_be_bytes(), self.method.key_len());
            self.method.session_cipher(&subkey)?
        } else {
            AeadCipher::xchacha20_poly1305(&user_psk)?
        };
        let fresh = RemoteSession {
            id,
            cipher,
            window: SlidingWindow::new(),
        };
        self.last_remote = std::mem::replace(&mut self.remote, Some(fresh));
        self.last_rotation = now;
        trace!(session = id, "adopted remote session");
        Ok(self.remote.as_mut().ok_or(Error::StreamClosed)?)
    }

    /// Decode one datagram from the server.
    pub fn decode(&mut self, packet: &[u8]) -> Result<(Address, u16, BytesMut)> {
        let now = self.clock.now();

        let mut body = if self.method.is_aes() {
            if packet.len() < PACKET_HEADER_LEN {
                return Err(Error::bad_header("Short packet"));
            }
            let mut header: [u8; 16] = packet[..PACKET_HEADER_LEN].try_into().unwrap();
            if let Some(block) = self.recv_block.as_ref() {
                block.decrypt_block(&mut header);
            }
            let session_id = u64::from_be_bytes(header[..8].try_into().unwrap());
            let packet_id = u64::from_be_bytes(header[8..].try_into().unwrap());

            let session = self.remote_session(session_id, now)?;
            if !session.window.check(packet_id) {
                return Err(Error::PacketIdNotUnique);
            }
            let body = session
                .cipher
                .open(&header[4..16], &[], &packet[PACKET_HEADER_LEN..])?;
            session.window.add(packet_id);
            BytesMut::from(&body[..])
        } else {
            if packet.len() < XCHACHA_NONCE_LEN + 16 {
                return Err(Error::bad_header("Short packet"));
            }
            let nonce = &packet[..XCHACHA_NONCE_LEN];
            let user_psk = self.psks.last().cloned().unwrap_or_default();
            let opened = AeadCipher::xchacha20_poly1305(&user_psk)?.open(
                nonce,
                &[],
                &packet[XCHACHA_NONCE_LEN..],
            )?;
            let mut body = BytesMut::from(&opened[..]);
            if body.remaining() < 16 {
                return Err(Error::bad_header("Short packet body"));
            }
            let session_id = body.get_u64();
            let packet_id = body.get_u64();

            let session = self.remote_session(session_id, now)?;
            if !session.window.check(packet_id) {
                return Err(Error::PacketIdNotUnique);
            }
            session.window.add(packet_id);
            body
        };

        if body.remaining() < 1 + 8 + 8 + 2 {
            return Err(Error::bad_header("Short packet body"));
        }
        let header_type = body.get_u8();
        if header_type != HEADER_TYPE_SERVER {
            return Err(Error::BadHeaderType(header_type));
        }
        check_timestamp(body.get_u64(), now)?;
        let echoed = body.get_u64();
        if !bool::from(echoed.to_be_bytes().ct_eq(&self.session_id.to_be_bytes())) {
            return Err(Error::BadClientSessionId);
        }
        let pad = body.get_u16() as usize;
        if pad > body.remaining() {
            return Err(Error::BadPadding);
        }
        body.advance(pad);
        let (address, port) = Address::read_socks(&mut body)?;
        Ok((address, port, body))
    }
}

/// Per-client state held by [`PacketService`]
struct ServerSession {
    recv_cipher: AeadCipher,
    window: SlidingWindow,
    reply_session_id: u64,
    reply_packet_id: u64,
    reply_cipher: AeadCipher,
}

/// Server half of the Shadowsocks-2022 UDP codec.
///
/// Sessions are looked up by client session id; the table is an LRU so
/// an abusive peer cannot grow it without bound.
pub struct PacketService {
    method: Method,
    psks: Vec<Vec<u8>>,
    user_psk: Vec<u8>,
    clock: Arc<dyn Clock>,
    /// Decrypts incoming packet headers (first hop key). AES only.
    header_block: Option<BlockCipher>,
    /// Encrypts outgoing packet headers (user key). AES only.
    reply_block: Option<BlockCipher>,
    sessions: Mutex<LruCache<u64, ServerSession>>,
}

impl PacketService {
    pub fn new(method: Method, psks: Vec<Vec<u8>>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_capacity(method, psks, clock, DEFAULT_MAX_SESSIONS)
    }

    pub fn with_capacity(
        method: Method,
        psks: Vec<Vec<u8>>,
        clock: Arc<dyn Clock>,
        max_sessions: usize,
    ) -> Result<Self> {
        let psks = method.reduce_keys(&psks)?;
        let user_psk = psks.last().cloned().unwrap_or_default();
        let (header_block, reply_block) = if method.is_aes() {
            (
                Some(BlockCipher::new(&psks[0])?),
                Some(BlockCipher::new(&user_psk)?),
            )
        } else {
            (None, None)
        };
        let capacity = NonZeroUsize::new(max_sessions)
            .ok_or_else(|| Error::protocol("Session capacity must be non-zero"))?;

        Ok(PacketService {
            method,
            psks,
            user_psk,
            clock,
            header_block,
            reply_block,
            sessions: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn new_session(&self, client_session_id: u64) -> Result<ServerSession> {
        let reply_session_id = random_u64()?;
        let (recv_cipher, reply_cipher) = if self.method.is_aes() {
            let recv_subkey = session_subkey(
                &self.user_psk,
                &client_session_id.to_be_bytes(),
                self.method.key_len(),
            );
            let reply_subkey = session_subkey(
                &self.user_psk,
                &reply_session_id.to_be_bytes(),
                self.method.key_len(),
            );
            (
                self.method.session_cipher(&recv_subkey)?,
                self.method.session_cipher(&reply_subkey)?,
            )
        } else {
            (
                AeadCipher::xchacha20_poly1305(&self.user_psk)?,
                AeadCipher::xchacha20_poly1305(&self.user_psk)?,
            )
        };
        Ok(ServerSession {
            recv_cipher,
            window: SlidingWindow::new(),
            reply_session_id,
            reply_packet_id: u64::MAX,
            reply_cipher,
        })
    }

    /// Decode one datagram from a client. Returns the client session id
    /// (the reply handle), the target, and the payload.
    pub fn decode(&self, packet: &[u8]) -> Result<(u64, Address, u16, BytesMut)> {
        let now = self.clock.now();

        let (client_session_id, mut body) = if self.method.is_aes() {
            if packet.len() < PACKET_HEADER_LEN {
                return Err(Error::bad_header("Short packet"));
            }
            let mut header: [u8; 16] = packet[..PACKET_HEADER_LEN].try_into().unwrap();
            if let Some(block) = self.header_block.as_ref() {
                block.decrypt_block(&mut header);
            }
            let session_id = u64::from_be_bytes(header[..8].try_into().unwrap());
            let packet_id = u64::from_be_bytes(header[8..].try_into().unwrap());

            let mut rest = &packet[PACKET_HEADER_LEN..];
            for i in 0..self.psks.len() - 1 {
                if rest.len() < 16 {
                    return Err(Error::bad_header("Short identity header"));
                }
                let mut identity: [u8; 16] = rest[..16].try_into().unwrap();
                BlockCipher::new(&self.psks[i])?.decrypt_block(&mut identity);
                for (b, h) in identity.iter_mut().zip(header.iter()) {
                    *b ^= h;
                }
                if !bool::from(identity.ct_eq(&psk_hash(&self.psks[i + 1]))) {
                    return Err(Error::bad_header("Identity header mismatch"));
                }
                rest = &rest[16..];
            }

            let mut sessions = self.sessions.lock();
            if !sessions.contains(&session_id) {
                sessions.put(session_id, self.new_session(session_id)?);
            }
            let session = sessions
                .get_mut(&session_id)
                .ok_or(Error::StreamClosed)?;
            if !session.window.check(packet_id) {
                return Err(Error::PacketIdNotUnique);
            }
            let body = session.recv_cipher.open(&header[4..16], &[], rest)?;
            session.window.add(packet_id);
            (session_id, BytesMut::from(&body[..]))
        } else {
            if packet.len() < XCHACHA_NONCE_LEN + 16 {
                return Err(Error::bad_header("Short packet"));
            }
            let opened = AeadCipher::xchacha20_poly1305(&self.user_psk)?.open(
                &packet[..XCHACHA_NONCE_LEN],
                &[],
                &packet[XCHACHA_NONCE_LEN..],
            )?;
            let mut body = BytesMut::from(&opened[..]);
            if body.remaining() < 16 {
                return Err(Error::bad_header("Short packet body"));
            }
            let session_id = body.get_u64();
            let packet_id = body.get_u64();

            let mut sessions = self.sessions.lock();
            if !sessions.contains(&session_id) {
                sessions.put(session_id, self.new_session(session_id)?);
            }
            let session = sessions
                .get_mut(&session_id)
                .ok_or(Error::StreamClosed)?;
            if !session.window.check(packet_id) {
                return Err(Error::PacketIdNotUnique);
            }
            session.window.add(packet_id);
            (session_id, body)
        };

        if body.remaining() < 1 + 8 + 2 {
            return Err(Error::bad_header("Short packet body"));
        }
        let header_type = body.get_u8();
        if header_type != HEADER_TYPE_CLIENT {
            return Err(Error::BadHeaderType(header_type));
        }
        check_timestamp(body.get_u64(), now)?;
        let pad = body.get_u16() as usize;
        if pad > body.remaining() {
            return Err(Error::BadPadding);
        }
        body.advance(pad);
        let (address, port) = Address::read_socks(&mut body)?;
        Ok((client_session_id, address, port, body))
    }

    /// Encode one reply to the client identified by `client_session_id`.
    pub fn encode(
        &self,
        client_session_id: u64,
        address: &Address,
        port: u16,
        payload: &[u8],
        out: &mut BytesMut,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&client_session_id)
            .ok_or_else(|| Error::protocol("Unknown client session"))?;
        session.reply_packet_id = session.reply_packet_id.wrapping_add(1);
        let pad = padding_len(port, payload.len());

        if self.method.is_aes() {
            let mut header = [0u8; PACKET_HEADER_LEN];
            header[..8].copy_from_slice(&session.reply_session_id.to_be_bytes());
            header[8..].copy_from_slice(&session.reply_packet_id.to_be_bytes());

            let mut body = BytesMut::with_capacity(
                1 + 8 + 8 + 2 + pad + address.len() + payload.len(),
            );
            body.put_u8(HEADER_TYPE_SERVER);
            body.put_u64(self.clock.now());
            body.put_u64(client_session_id);
            put_padding(&mut body, pad);
            address.write_socks(&mut body, port)?;
            body.put_slice(payload);

            let sealed = session.reply_cipher.seal(&header[4..16], &[], &body)?;

            let mut enc_header = header;
            if let Some(block) = self.reply_block.as_ref() {
                block.encrypt_block(&mut enc_header);
            }
            out.put_slice(&enc_header);
            out.put_slice(&sealed);
        } else {
            let mut nonce = [0u8; XCHACHA_NONCE_LEN];
            getrandom::getrandom(&mut nonce).map_err(|e| Error::key(e.to_string()))?;

            let mut body = BytesMut::with_capacity(
                16 + 1 + 8 + 8 + 2 + pad + address.len() + payload.len(),
            );
            body.put_u64(session.reply_session_id);
            body.put_u64(session.reply_packet_id);
            body.put_u8(HEADER_TYPE_SERVER);
            body.put_u64(self.clock.now());
            body.put_u64(client_session_id);
            put_padding(&mut body, pad);
            address.write_socks(&mut body, port)?;
            body.put_slice(payload);

            let sealed = session.reply_cipher.seal(&nonce, &[], &body)?;
            out.put_slice(&nonce);
            out.put_slice(&sealed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(1_700_000_000))
    }

    fn round_trip(method: Method, psks: Vec<Vec<u8>>) {
        let mut client = PacketClient::new(method, psks.clone(), clock()).unwrap();
        let service = PacketService::new(method, psks, clock()).unwrap();

        let mut wire = BytesMut::new();
        client
            .encode(&Address::from("1.1.1.1"), 53, b"query", &mut wire)
            .unwrap();
        let (handle, address, port, payload) = service.decode(&wire).unwrap();
        assert_eq!(address, Address::from("1.1.1.1"));
        assert_eq!(port, 53);
        assert_eq!(&payload[..], b"query");

        let mut reply = BytesMut::new();
        service
            .encode(handle, &Address::from("1.1.1.1"), 53, b"answer", &mut reply)
            .unwrap();
        let (address, port, payload) = client.decode(&reply).unwrap();
        assert_eq!(address, Address::from("1.1.1.1"));
        assert_eq!(port, 53);
        assert_eq!(&payload[..], b"answer");
    }

    #[test]
    fn test_aes_round_trip() {
        round_trip(Method::Blake3Aes128Gcm, vec![vec![0x11u8; 16]]);
        round_trip(Method::Blake3Aes256Gcm, vec![vec![0x22u8; 32]]);
    }

    #[test]
    fn test_aes_identity_chain_round_trip() {
        round_trip(
            Method::Blake3Aes128Gcm,
            vec![vec![0x01u8; 16], vec![0x02u8; 16]],
        );
    }

    #[test]
    fn test_xchacha_round_trip() {
        round_trip(Method::Blake3ChaCha20Poly1305, vec![vec![0xaau8; 32]]);
    }

    #[test]
    fn test_replayed_packet_rejected() {
        let psks = vec![vec![0x11u8; 16]];
        let mut client = PacketClient::new(Method::Blake3Aes128Gcm, psks.clone(), clock()).unwrap();
        let service = PacketService::new(Method::Blake3Aes128Gcm, psks, clock()).unwrap();

        let mut wire = BytesMut::new();
        client
            .encode(&Address::from("1.1.1.1"), 443, b"data", &mut wire)
            .unwrap();
        service.decode(&wire).unwrap();
        assert!(matches!(
            service.decode(&wire),
            Err(Error::PacketIdNotUnique)
        ));
    }

    #[test]
    fn test_session_rotation_rate_limited() {
        let psks = vec![vec![0xaau8; 32]];
        let method = Method::Blake3ChaCha20Poly1305;
        let mut client = PacketClient::new(method, psks.clone(), clock()).unwrap();

        // Two services simulate a server restarting with fresh session ids.
        let first = PacketService::new(method, psks.clone(), clock()).unwrap();
        let second = PacketService::new(method, psks, clock()).unwrap();

        let mut wire = BytesMut::new();
        client
            .encode(&Address::from("1.1.1.1"), 53, b"q1", &mut wire)
            .unwrap();
        let (handle, ..) = first.decode(&wire).unwrap();
        let mut reply = BytesMut::new();
        first
            .encode(handle, &Address::from("1.1.1.1"), 53, b"a1", &mut reply)
            .unwrap();
        client.decode(&reply).unwrap();

        let mut wire = BytesMut::new();
        client
            .encode(&Address::from("1.1.1.1"), 53, b"q2", &mut wire)
            .unwrap();
        let (handle, ..) = second.decode(&wire).unwrap();
        let mut reply = BytesMut::new();
        second
            .encode(handle, &Address::from("1.1.1.1"), 53, b"a2", &mut reply)
            .unwrap();
        assert!(matches!(
            client.decode(&reply),
            Err(Error::TooManyServerSessions)
        ));
    }

    #[test]
    fn test_wrong_client_session_echo_rejected() {
        let psks = vec![vec![0x11u8; 16]];
        let method = Method::Blake3Aes128Gcm;
        let mut client = PacketClient::new(method, psks.clone(), clock()).unwrap();
        let mut other = PacketClient::new(method, psks.clone(), clock()).unwrap();
        let service = PacketService::new(method, psks, clock()).unwrap();

        let mut wire = BytesMut::new();
        other
            .encode(&Address::from("1.1.1.1"), 443, b"data", &mut wire)
            .unwrap();
        let (handle, ..) = service.decode(&wire).unwrap();
        let mut reply = BytesMut::new();
        service
            .encode(handle, &Address::from("1.1.1.1"), 443, b"resp", &mut reply)
            .unwrap();
        // Reply addressed to the other client's session.
        assert!(matches!(
            client.decode(&reply),
            Err(Error::BadClientSessionId)
        ));
    }
}
