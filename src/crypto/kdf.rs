//! Key derivation for the Shadowsocks family
//!
//! Shadowsocks-2022 keys come from BLAKE3 derive-key with fixed domain
//! strings; legacy Shadowsocks AEAD uses HKDF-SHA1 with the "ss-subkey"
//! info and the OpenSSL EVP_BytesToKey password expansion. The VMess
//! HMAC chain lives in `vmess::kdf`.

use crate::{Error, Result};
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;

const SESSION_SUBKEY_CONTEXT: &str = "shadowsocks 2022 session subkey";
const IDENTITY_SUBKEY_CONTEXT: &str = "shadowsocks 2022 identity subkey";

fn blake3_derive(context: &str, psk: &[u8], salt: &[u8], out: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(psk);
    hasher.update(salt);
    hasher.finalize_xof().fill(out);
}

/// Per-direction session subkey for Shadowsocks-2022
pub fn session_subkey(psk: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; key_len];
    blake3_derive(SESSION_SUBKEY_CONTEXT, psk, salt, &mut out);
    out
}

/// Identity-header subkey for Shadowsocks-2022 multi-user relay
pub fn identity_subkey(psk: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; key_len];
    blake3_derive(IDENTITY_SUBKEY_CONTEXT, psk, salt, &mut out);
    out
}

/// First 16 bytes of the 64-byte BLAKE3 hash of a psk, used to select
/// the next hop's key inside identity headers.
pub fn psk_hash(psk: &[u8]) -> [u8; 16] {
    let mut wide = [0u8; 64];
    let mut hasher = blake3::Hasher::new();
    hasher.update(psk);
    hasher.finalize_xof().fill(&mut wide);
    let mut out = [0u8; 16];
    out.copy_from_slice(&wide[..16]);
    out
}

/// Normalise a configured Shadowsocks-2022 key to the cipher key length.
///
/// Longer keys are reduced with SHA-256; shorter keys are rejected.
pub fn reduce_psk(key: &[u8], key_len: usize) -> Result<Vec<u8>> {
    if key.len() == key_len {
        return Ok(key.to_vec());
    }
    if key.len() > key_len {
        let digest = Sha256::digest(key);
        return Ok(digest[..key_len].to_vec());
    }
    Err(Error::key(format!(
        "key too short: need {} bytes, got {}",
        key_len,
        key.len()
    )))
}

/// Derive a legacy Shadowsocks AEAD subkey (HKDF-SHA1, "ss-subkey")
pub fn ss_subkey(key: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    let mut subkey = vec![0u8; key.len()];
    hk.expand(b"ss-subkey", &mut subkey)
        .map_err(|e| Error::key(e.to_string()))?;
    Ok(subkey)
}

/// Derive a master key from a password using EVP_BytesToKey
pub fn evp_bytes_to_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        prev = digest.to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    key
}

/// Deterministic 32-byte ChaCha20-Poly1305 key from a 16-byte key:
/// `md5(k) || md5(md5(k))`
pub fn expand_chacha_key(key16: &[u8; 16]) -> [u8; 32] {
    let mut key32 = [0u8; 32];
    let mut hasher = Md5::new();
    hasher.update(key16);
    let t = hasher.finalize_reset();
    key32[..16].copy_from_slice(&t);

    hasher.update(&key32[..16]);
    let t = hasher.finalize();
    key32[16..].copy_from_slice(&t);
    key32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_subkey_depends_on_salt() {
        let psk = [1u8; 16];
        let a = session_subkey(&psk, &[0u8; 16], 16);
        let b = session_subkey(&psk, &[1u8; 16], 16);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_identity_and_session_contexts_differ() {
        let psk = [2u8; 32];
        let salt = [3u8; 32];
        assert_ne!(session_subkey(&psk, &salt, 32), identity_subkey(&psk, &salt, 32));
    }

    #[test]
    fn test_reduce_psk() {
        assert_eq!(reduce_psk(&[5u8; 16], 16).unwrap(), vec![5u8; 16]);
        let reduced = reduce_psk(b"a-much-longer-configured-password", 16).unwrap();
        assert_eq!(reduced.len(), 16);
        assert!(reduce_psk(&[1u8; 8], 16).is_err());
    }

    #[test]
    fn test_evp_bytes_to_key() {
        let key = evp_bytes_to_key("test", 32);
        assert_eq!(key.len(), 32);
        // Stable across calls
        assert_eq!(key, evp_bytes_to_key("test", 32));
    }

    #[test]
    fn test_expand_chacha_key_prefix() {
        let key16 = [9u8; 16];
        let key32 = expand_chacha_key(&key16);
        let first = Md5::digest(key16);
        assert_eq!(&key32[..16], first.as_slice());
    }

    #[test]
    fn test_psk_hash_len() {
        assert_ne!(psk_hash(&[1u8; 16]), psk_hash(&[2u8; 16]));
    }
}
