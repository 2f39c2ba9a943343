//! Shadowsocks-form chunked record layer
//!
//! A stream is framed as `seal(len_be16) || seal(payload)` pairs; both
//! seals advance one little-endian counter nonce, so length and payload
//! consume consecutive nonce values. Shadowsocks-2022 additionally
//! writes header material as standalone sealed chunks on the same nonce
//! sequence (see `open_fixed`/`seal_chunk`).

use crate::crypto::{increment_nonce, AeadCipher, TAG_SIZE};
use crate::Result;
use bytes::{BufMut, BytesMut};

/// Maximum plaintext bytes per chunk
pub const MAX_PACKET_SIZE: usize = 16 * 1024 - 1;

/// Sealing half of one stream direction
pub struct ChunkWriter {
    cipher: AeadCipher,
    nonce: Vec<u8>,
}

impl ChunkWriter {
    pub fn new(cipher: AeadCipher) -> Self {
        let nonce = vec![0u8; cipher.nonce_size()];
        ChunkWriter { cipher, nonce }
    }

    /// Seal one chunk and advance the nonce.
    pub fn seal_chunk(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.cipher.seal(&self.nonce, &[], plaintext)?;
        increment_nonce(&mut self.nonce);
        Ok(sealed)
    }

    /// Frame `payload` as length-prefixed chunks into `out`.
    pub fn encode(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        for chunk in payload.chunks(MAX_PACKET_SIZE) {
            let len_bytes = (chunk.len() as u16).to_be_bytes();
            let sealed_len = self.seal_chunk(&len_bytes)?;
            let sealed_payload = self.seal_chunk(chunk)?;
            out.reserve(sealed_len.len() + sealed_payload.len());
            out.put_slice(&sealed_len);
            out.put_slice(&sealed_payload);
        }
        Ok(())
    }
}

/// Opening half of one stream direction
pub struct ChunkReader {
    cipher: AeadCipher,
    nonce: Vec<u8>,
    pending_len: Option<usize>,
}

impl ChunkReader {
    pub fn new(cipher: AeadCipher) -> Self {
        let nonce = vec![0u8; cipher.nonce_size()];
        ChunkReader {
            cipher,
            nonce,
            pending_len: None,
        }
    }

    /// Open one sealed chunk and advance the nonce.
    pub fn open_chunk(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plain = self.cipher.open(&self.nonce, &[], ciphertext)?;
        increment_nonce(&mut self.nonce);
        Ok(plain)
    }

    /// Open a standalone chunk whose plaintext length is known up front.
    ///
    /// Returns `None` if `src` does not yet hold the whole chunk.
    pub fn open_fixed(&mut self, src: &mut BytesMut, plain_len: usize) -> Result<Option<Vec<u8>>> {
        if src.len() < plain_len + TAG_SIZE {
            return Ok(None);
        }
        let ciphertext = src.split_to(plain_len + TAG_SIZE);
        self.open_chunk(&ciphertext).map(Some)
    }

    /// Drain as many complete length-prefixed chunks from `src` into
    /// `out` as possible. Returns true if any plaintext was produced.
    pub fn decode(&mut self, src: &mut BytesMut, out: &mut BytesMut) -> Result<bool> {
        let mut produced = false;
        loop {
            if self.pending_len.is_none() {
                if src.len() < 2 + TAG_SIZE {
                    break;
                }
                let ciphertext = src.split_to(2 + TAG_SIZE);
                let plain = self.open_chunk(&ciphertext)?;
                let len = u16::from_be_bytes([plain[0], plain[1]]) as usize & MAX_PACKET_SIZE;
                self.pending_len = Some(len);
            }

            let len = self.pending_len.unwrap_or_default();
            if src.len() < len + TAG_SIZE {
                break;
            }
            let ciphertext = src.split_to(len + TAG_SIZE);
            let plain = self.open_chunk(&ciphertext)?;
            out.put_slice(&plain);
            self.pending_len = None;
            produced = true;
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn pair() -> (ChunkWriter, ChunkReader) {
        let key = [0x55u8; 16];
        (
            ChunkWriter::new(AeadCipher::aes_128_gcm(&key).unwrap()),
            ChunkReader::new(AeadCipher::aes_128_gcm(&key).unwrap()),
        )
    }

    #[test]
    fn test_round_trip_multiple_chunks() {
        let (mut writer, mut reader) = pair();
        let mut wire = BytesMut::new();
        writer.encode(b"first", &mut wire).unwrap();
        writer.encode(b"second", &mut wire).unwrap();

        let mut out = BytesMut::new();
        assert!(reader.decode(&mut wire, &mut out).unwrap());
        assert_eq!(&out[..], b"firstsecond");
        assert!(wire.is_empty());
    }

    #[test]
    fn test_large_payload_splits() {
        let (mut writer, mut reader) = pair();
        let payload = vec![0xabu8; MAX_PACKET_SIZE + 100];
        let mut wire = BytesMut::new();
        writer.encode(&payload, &mut wire).unwrap();
        // Two length chunks and two payload chunks
        assert_eq!(
            wire.len(),
            2 * (2 + TAG_SIZE) + payload.len() + 2 * TAG_SIZE
        );

        let mut out = BytesMut::new();
        reader.decode(&mut wire, &mut out).unwrap();
        assert_eq!(&out[..], &payload[..]);
    }

    #[test]
    fn test_partial_input_waits() {
        let (mut writer, mut reader) = pair();
        let mut wire = BytesMut::new();
        writer.encode(b"data", &mut wire).unwrap();

        let mut partial = wire.split_to(wire.len() - 1);
        let mut out = BytesMut::new();
        assert!(!reader.decode(&mut partial, &mut out).unwrap());
        assert!(out.is_empty());

        partial.unsplit(wire);
        assert!(reader.decode(&mut partial, &mut out).unwrap());
        assert_eq!(&out[..], b"data");
    }

    #[test]
    fn test_tampered_chunk_fails() {
        let (mut writer, mut reader) = pair();
        let mut wire = BytesMut::new();
        writer.encode(b"payload", &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 1;

        let mut out = BytesMut::new();
        assert!(matches!(
            reader.decode(&mut wire, &mut out),
            Err(Error::BadTag)
        ));
    }

    #[test]
    fn test_fixed_chunk_shares_nonce_sequence() {
        let (mut writer, mut reader) = pair();
        let header = writer.seal_chunk(b"header-material").unwrap();
        let mut wire = BytesMut::from(&header[..]);
        writer.encode(b"body", &mut wire).unwrap();

        let opened = reader.open_fixed(&mut wire, 15).unwrap().unwrap();
        assert_eq!(&opened[..], b"header-material");
        let mut out = BytesMut::new();
        reader.decode(&mut wire, &mut out).unwrap();
        assert_eq!(&out[..], b"body");
    }
}
