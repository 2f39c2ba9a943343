//! Shadowsocks-2022 (SIP022)
//!
//! BLAKE3-keyed AEAD with mandatory replay protection. Streams carry a
//! salted handshake with timestamped header chunks; datagrams carry
//! separate session headers with sliding-window packet ids. Multi-hop
//! relay is expressed through stacked identity headers, one per
//! intermediate key.

pub mod packet;
pub mod stream;

pub use packet::{PacketClient, PacketService};
pub use stream::{ClientStream, ServerStream, Service};

use crate::crypto::kdf::{identity_subkey, psk_hash, reduce_psk};
use crate::crypto::{AeadCipher, BlockCipher};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Tolerated clock skew between peers, in seconds
pub const MAX_TIME_DIFF: u64 = 30;
/// Handshake salt retention, in seconds
pub const SALT_WINDOW: u64 = 60;
/// Upper bound on header padding
pub const MAX_PADDING_LENGTH: usize = 900;

pub(crate) const HEADER_TYPE_CLIENT: u8 = 0;
pub(crate) const HEADER_TYPE_SERVER: u8 = 1;

/// Shadowsocks-2022 cipher method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "2022-blake3-aes-128-gcm")]
    Blake3Aes128Gcm,
    #[serde(rename = "2022-blake3-aes-256-gcm")]
    Blake3Aes256Gcm,
    #[serde(rename = "2022-blake3-chacha20-poly1305")]
    Blake3ChaCha20Poly1305,
}

impl Method {
    pub fn key_len(&self) -> usize {
        match self {
            Method::Blake3Aes128Gcm => 16,
            Method::Blake3Aes256Gcm => 32,
            Method::Blake3ChaCha20Poly1305 => 32,
        }
    }

    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    /// AES methods support identity headers and structured UDP session
    /// headers; the ChaCha method is single-key only.
    pub fn is_aes(&self) -> bool {
        !matches!(self, Method::Blake3ChaCha20Poly1305)
    }

    /// AEAD instance for a derived session subkey
    pub(crate) fn session_cipher(&self, subkey: &[u8]) -> Result<AeadCipher> {
        match self {
            Method::Blake3Aes128Gcm => AeadCipher::aes_128_gcm(subkey),
            Method::Blake3Aes256Gcm => AeadCipher::aes_256_gcm(subkey),
            Method::Blake3ChaCha20Poly1305 => AeadCipher::chacha20_poly1305(subkey),
        }
    }

    /// Normalise a configured key list to this method's key length.
    pub fn reduce_keys(&self, keys: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if keys.is_empty() {
            return Err(Error::key("At least one key is required"));
        }
        if keys.len() > 1 && !self.is_aes() {
            return Err(Error::key("Identity keys require an AES method"));
        }
        keys.iter().map(|k| reduce_psk(k, self.key_len())).collect()
    }
}

impl TryFrom<&str> for Method {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "2022-blake3-aes-128-gcm" => Ok(Method::Blake3Aes128Gcm),
            "2022-blake3-aes-256-gcm" => Ok(Method::Blake3Aes256Gcm),
            "2022-blake3-chacha20-poly1305" => Ok(Method::Blake3ChaCha20Poly1305),
            _ => Err(Error::protocol(format!("Unsupported method: {}", s))),
        }
    }
}

/// Encrypt one identity header block: the hash of the next hop's key
/// under the current hop's identity subkey.
pub(crate) fn seal_identity_header(
    method: Method,
    psk: &[u8],
    next_psk: &[u8],
    salt: &[u8],
) -> Result<[u8; 16]> {
    let subkey = identity_subkey(psk, salt, method.key_len());
    let cipher = BlockCipher::new(&subkey)?;
    let mut block = psk_hash(next_psk);
    cipher.encrypt_block(&mut block);
    Ok(block)
}

/// Verify one identity header block against the expected next-hop key.
pub(crate) fn open_identity_header(
    method: Method,
    psk: &[u8],
    next_psk: &[u8],
    salt: &[u8],
    block: &[u8; 16],
) -> Result<()> {
    use subtle::ConstantTimeEq;

    let subkey = identity_subkey(psk, salt, method.key_len());
    let cipher = BlockCipher::new(&subkey)?;
    let mut decrypted = *block;
    cipher.decrypt_block(&mut decrypted);
    if decrypted.ct_eq(&psk_hash(next_psk)).into() {
        Ok(())
    } else {
        Err(Error::bad_header("Identity header mismatch"))
    }
}

pub(crate) fn check_timestamp(ts: u64, now: u64) -> Result<()> {
    if now.abs_diff(ts) > MAX_TIME_DIFF {
        return Err(Error::BadTimestamp(ts));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!(
            Method::try_from("2022-blake3-aes-128-gcm").unwrap(),
            Method::Blake3Aes128Gcm
        );
        assert!(Method::try_from("2022-blake3-aes-192-gcm").is_err());
    }

    #[test]
    fn test_reduce_keys() {
        let method = Method::Blake3Aes128Gcm;
        let keys = method
            .reduce_keys(&[b"a-long-enough-identity-password".to_vec(), vec![1u8; 16]])
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.len() == 16));

        assert!(Method::Blake3ChaCha20Poly1305
            .reduce_keys(&[vec![1u8; 32], vec![2u8; 32]])
            .is_err());
        assert!(method.reduce_keys(&[]).is_err());
    }

    #[test]
    fn test_identity_header_round_trip() {
        let method = Method::Blake3Aes128Gcm;
        let psk = vec![7u8; 16];
        let next = vec![8u8; 16];
        let salt = [9u8; 16];

        let block = seal_identity_header(method, &psk, &next, &salt).unwrap();
        open_identity_header(method, &psk, &next, &salt, &block).unwrap();

        let other = vec![10u8; 16];
        assert!(open_identity_header(method, &psk, &other, &salt, &block).is_err());
    }

    #[test]
    fn test_check_timestamp() {
        assert!(check_timestamp(100, 120).is_ok());
        assert!(check_timestamp(120, 100).is_ok());
        assert!(matches!(
            check_timestamp(100, 131),
            Err(Error::BadTimestamp(100))
        ));
    }
}
