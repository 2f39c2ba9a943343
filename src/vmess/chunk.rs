//! VMess body framing
//!
//! Chunks are `length || ciphertext || padding`. The 2-byte length may
//! be XOR-masked by a SHAKE-128 stream seeded with the body nonce, or
//! replaced by an AEAD-sealed length under a dedicated "auth_len" key.
//! Padding lengths come from a SHAKE instance seeded the same way,
//! shared with masking when both options are on; per chunk the padding
//! value is drawn before the mask value, on both sides.
//!
//! A chunk whose data length works out to zero ends the stream. With
//! sealed lengths that marker wraps modulo 2^16, which is why length
//! arithmetic here is deliberately `wrapping_*`.

use super::{ResolvedSecurity, fnv1a_hash, OPTION_AUTHENTICATED_LENGTH, OPTION_CHUNK_MASKING, OPTION_GLOBAL_PADDING};
use crate::crypto::kdf::expand_chacha_key;
use crate::crypto::{AeadCipher, TAG_SIZE};
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use sha3::digest::{ExtendableOutput, XofReader};
use sha3::Shake128;

pub(crate) const WRITE_CHUNK_SIZE: usize = 15000;
const MAX_PADDING: u16 = 64;
const LEGACY_CHECKSUM_LEN: usize = 4;
const SEALED_LENGTH_LEN: usize = 2 + TAG_SIZE;

type Shake128Reader = <Shake128 as ExtendableOutput>::Reader;

struct ChunkMask {
    reader: Shake128Reader,
}

impl ChunkMask {
    fn new(seed: &[u8]) -> Self {
        let mut shake = Shake128::default();
        sha3::digest::Update::update(&mut shake, seed);
        ChunkMask {
            reader: shake.finalize_xof(),
        }
    }

    fn next_u16(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        self.reader.read(&mut buf);
        u16::from_be_bytes(buf)
    }
}

enum BodyCipher {
    /// Plaintext chunks (security "none")
    None,
    Aead(AeadCipher),
    /// FNV1a checksum framing; the CFB layer is applied by the stream
    Legacy,
}

impl BodyCipher {
    fn overhead(&self) -> usize {
        match self {
            BodyCipher::None => 0,
            BodyCipher::Aead(_) => TAG_SIZE,
            BodyCipher::Legacy => LEGACY_CHECKSUM_LEN,
        }
    }
}

/// AEAD over the 2-byte chunk length, with its own nonce counter
struct LengthCipher {
    cipher: AeadCipher,
    nonce_suffix: [u8; 10],
    count: u16,
}

impl LengthCipher {
    fn new(security: ResolvedSecurity, auth_len_key: &[u8; 16], nonce16: &[u8; 16]) -> Result<Self> {
        let cipher = match security {
            ResolvedSecurity::ChaCha20Poly1305 => {
                AeadCipher::chacha20_poly1305(&expand_chacha_key(auth_len_key))?
            }
            _ => AeadCipher::aes_128_gcm(auth_len_key)?,
        };
        let mut nonce_suffix = [0u8; 10];
        nonce_suffix.copy_from_slice(&nonce16[2..12]);
        Ok(LengthCipher {
            cipher,
            nonce_suffix,
            count: 0,
        })
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..2].copy_from_slice(&self.count.to_be_bytes());
        nonce[2..].copy_from_slice(&self.nonce_suffix);
        self.count = self.count.wrapping_add(1);
        nonce
    }

    fn seal(&mut self, value: u16) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher.seal(&nonce, &[], &value.to_be_bytes())
    }

    fn open(&mut self, sealed: &[u8]) -> Result<u16> {
        let nonce = self.next_nonce();
        let plain = self.cipher.open(&nonce, &[], sealed)?;
        if plain.len() != 2 {
            return Err(Error::BadLengthChunk);
        }
        Ok(u16::from_be_bytes([plain[0], plain[1]]))
    }
}

/// Decode progress for one call
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// More input needed; nothing (further) produced
    Pending,
    /// At least one chunk of plaintext was appended
    Produced,
    /// The peer ended the stream cleanly
    Eof,
}

struct PendingChunk {
    data_len: usize,
    pad: usize,
}

fn make_nonce(count: &mut u16, suffix: &[u8; 10]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..2].copy_from_slice(&count.to_be_bytes());
    nonce[2..].copy_from_slice(suffix);
    *count = count.wrapping_add(1);
    nonce
}

/// One direction of a VMess body.
pub(crate) struct BodyCodec {
    cipher: BodyCipher,
    nonce_suffix: [u8; 10],
    nonce_count: u16,
    shake: Option<ChunkMask>,
    masking: bool,
    padding: bool,
    length_cipher: Option<LengthCipher>,
    pending: Option<PendingChunk>,
}

impl BodyCodec {
    /// `auth_len_key` is the "auth_len" KDF of the request body key; it
    /// is shared by both directions.
    pub(crate) fn new(
        security: ResolvedSecurity,
        key: &[u8; 16],
        nonce: &[u8; 16],
        option: u8,
        auth_len_key: &[u8; 16],
    ) -> Result<Self> {
        let cipher = match security {
            ResolvedSecurity::Aes128Gcm => BodyCipher::Aead(AeadCipher::aes_128_gcm(key)?),
            ResolvedSecurity::ChaCha20Poly1305 => {
                BodyCipher::Aead(AeadCipher::chacha20_poly1305(&expand_chacha_key(key))?)
            }
            ResolvedSecurity::None | ResolvedSecurity::Zero => BodyCipher::None,
            ResolvedSecurity::Legacy => BodyCipher::Legacy,
        };

        let masking = option & OPTION_CHUNK_MASKING != 0;
        let padding = option & OPTION_GLOBAL_PADDING != 0;
        let auth_len = option & OPTION_AUTHENTICATED_LENGTH != 0 && security.is_aead();

        // Padding and masking share one shake when both are on.
        let shake = if masking || padding {
            Some(ChunkMask::new(nonce))
        } else {
            None
        };
        let length_cipher = if auth_len {
            Some(LengthCipher::new(security, auth_len_key, nonce)?)
        } else {
            None
        };

        let mut nonce_suffix = [0u8; 10];
        nonce_suffix.copy_from_slice(&nonce[2..12]);

        Ok(BodyCodec {
            cipher,
            nonce_suffix,
            nonce_count: 0,
            shake,
            masking,
            padding,
            length_cipher,
            pending: None,
        })
    }

    /// Draw this chunk's padding length, then its length mask. The
    /// order is part of the wire format.
    fn next_pad_and_mask(&mut self) -> (usize, u16) {
        let pad = if self.padding {
            self.shake
                .as_mut()
                .map(|s| s.next_u16() % MAX_PADDING)
                .unwrap_or(0) as usize
        } else {
            0
        };
        // The sealed-length variant replaces the masked parser, so no
        // mask value is drawn for it.
        let mask = if self.masking && self.length_cipher.is_none() {
            self.shake.as_mut().map(|s| s.next_u16()).unwrap_or(0)
        } else {
            0
        };
        (pad, mask)
    }

    fn length_field_size(&self) -> usize {
        if self.length_cipher.is_some() {
            SEALED_LENGTH_LEN
        } else {
            2
        }
    }

    fn put_length(&mut self, total: u16, mask: u16, out: &mut BytesMut) -> Result<()> {
        if let Some(lc) = self.length_cipher.as_mut() {
            let sealed = lc.seal(total.wrapping_sub(TAG_SIZE as u16))?;
            out.put_slice(&sealed);
        } else {
            out.put_u16(total ^ mask);
        }
        Ok(())
    }

    fn encode_chunk(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
        let ciphertext = match &self.cipher {
            BodyCipher::None => data.to_vec(),
            BodyCipher::Legacy => {
                let mut framed = Vec::with_capacity(LEGACY_CHECKSUM_LEN + data.len());
                framed.extend_from_slice(&fnv1a_hash(data).to_be_bytes());
                framed.extend_from_slice(data);
                framed
            }
            BodyCipher::Aead(cipher) => {
                let nonce = make_nonce(&mut self.nonce_count, &self.nonce_suffix);
                cipher.seal(&nonce, &[], data)?
            }
        };

        let (pad, mask) = self.next_pad_and_mask();
        let total = ciphertext.len() + pad;
        if total > u16::MAX as usize {
            return Err(Error::BadLengthChunk);
        }
        self.put_length(total as u16, mask, out)?;
        out.put_slice(&ciphertext);
        out.resize(out.len() + pad, 0);
        Ok(())
    }

    /// Frame `payload` into as many chunks as needed.
    pub(crate) fn encode(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        for data in payload.chunks(WRITE_CHUNK_SIZE) {
            self.encode_chunk(data, out)?;
        }
        Ok(())
    }

    /// Write the end-of-stream marker: a chunk whose data length is
    /// zero once padding is removed.
    pub(crate) fn encode_eof(&mut self, out: &mut BytesMut) -> Result<()> {
        let (pad, mask) = self.next_pad_and_mask();
        self.put_length(pad as u16, mask, out)?;
        out.resize(out.len() + pad, 0);
        Ok(())
    }

    fn open_chunk(&mut self, ciphertext: &[u8], out: &mut BytesMut) -> Result<()> {
        match &self.cipher {
            BodyCipher::None => {
                out.put_slice(ciphertext);
                Ok(())
            }
            BodyCipher::Legacy => {
                if ciphertext.len() < LEGACY_CHECKSUM_LEN {
                    return Err(Error::BadLengthChunk);
                }
                let expected = u32::from_be_bytes(ciphertext[..4].try_into().unwrap());
                let payload = &ciphertext[LEGACY_CHECKSUM_LEN..];
                if fnv1a_hash(payload) != expected {
                    return Err(Error::BadChecksum);
                }
                out.put_slice(payload);
                Ok(())
            }
            BodyCipher::Aead(cipher) => {
                let nonce = make_nonce(&mut self.nonce_count, &self.nonce_suffix);
                let plain = cipher.open(&nonce, &[], ciphertext)?;
                out.put_slice(&plain);
                Ok(())
            }
        }
    }

    /// Drain whole chunks from `src` into `out`.
    pub(crate) fn decode(&mut self, src: &mut BytesMut, out: &mut BytesMut) -> Result<Decoded> {
        let mut produced = false;
        loop {
            if self.pending.is_none() {
                let field = self.length_field_size();
                if src.len() < field {
                    break;
                }
                let (pad, mask) = self.next_pad_and_mask();
                let total = if let Some(lc) = self.length_cipher.as_mut() {
                    let sealed = src.split_to(SEALED_LENGTH_LEN);
                    lc.open(&sealed)?.wrapping_add(TAG_SIZE as u16) as usize
                } else {
                    (src.get_u16() ^ mask) as usize
                };
                let data_len = total
                    .checked_sub(pad)
                    .ok_or(Error::BadLengthChunk)?;
                if data_len > 0 && data_len < self.cipher.overhead() {
                    return Err(Error::BadLengthChunk);
                }
                self.pending = Some(PendingChunk { data_len, pad });
            }

            let PendingChunk { data_len, pad } = *self.pending.as_ref().ok_or(Error::BadLengthChunk)?;
            if src.len() < data_len + pad {
                break;
            }
            let ciphertext = src.split_to(data_len);
            src.advance(pad);
            self.pending = None;
            if data_len == 0 {
                return Ok(Decoded::Eof);
            }
            self.open_chunk(&ciphertext, out)?;
            produced = true;
        }
        Ok(if produced {
            Decoded::Produced
        } else {
            Decoded::Pending
        })
    }
}
