//! VMess AEAD key derivation
//!
//! The KDF is a chain of nested HMAC-SHA256 instances: the root is
//! keyed by a fixed label, each salt in the path wraps the chain in
//! another HMAC, and the final instance hashes the input key. HMAC
//! keyed by HMAC is not expressible with the type-level `hmac` crate
//! API, so the chain is built from boxed hash instances.

use sha2::{Digest, Sha256};
use std::sync::Arc;

pub(crate) const KDF_SALT_AUTH_ID_ENCRYPTION_KEY: &[u8] = b"AES Auth ID Encryption";
pub(crate) const KDF_SALT_AEAD_RESP_HEADER_LEN_KEY: &[u8] = b"AEAD Resp Header Len Key";
pub(crate) const KDF_SALT_AEAD_RESP_HEADER_LEN_IV: &[u8] = b"AEAD Resp Header Len IV";
pub(crate) const KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_KEY: &[u8] = b"AEAD Resp Header Key";
pub(crate) const KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_IV: &[u8] = b"AEAD Resp Header IV";
pub(crate) const KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_KEY: &[u8] = b"VMess Header AEAD Key";
pub(crate) const KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_IV: &[u8] = b"VMess Header AEAD Nonce";
pub(crate) const KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_KEY: &[u8] =
    b"VMess Header AEAD Key_Length";
pub(crate) const KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_IV: &[u8] =
    b"VMess Header AEAD Nonce_Length";
pub(crate) const KDF_SALT_AUTH_LEN: &[u8] = b"auth_len";

const KDF_ROOT: &[u8] = b"VMess AEAD KDF";
const SHA256_BLOCK_SIZE: usize = 64;

trait ChainHash: Send + Sync {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> Vec<u8>;
}

trait ChainHashFactory: Send + Sync {
    fn create(&self) -> Box<dyn ChainHash>;
}

struct Sha256Factory;

impl ChainHashFactory for Sha256Factory {
    fn create(&self) -> Box<dyn ChainHash> {
        Box::new(Sha256::new())
    }
}

impl ChainHash for Sha256 {
    fn update(&mut self, data: &[u8]) {
        Digest::update(self, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        Digest::finalize(*self).to_vec()
    }
}

struct HmacFactory {
    key: Vec<u8>,
    inner: Arc<dyn ChainHashFactory>,
}

impl ChainHashFactory for HmacFactory {
    fn create(&self) -> Box<dyn ChainHash> {
        Box::new(ChainHmac::new(self.key.clone(), self.inner.clone()))
    }
}

struct ChainHmac {
    inner_factory: Arc<dyn ChainHashFactory>,
    inner: Box<dyn ChainHash>,
    opad: Vec<u8>,
}

impl ChainHmac {
    fn new(key: Vec<u8>, inner_factory: Arc<dyn ChainHashFactory>) -> Self {
        // Keys longer than the block size would be pre-hashed in
        // standard HMAC; the VMess chain never produces one.
        let mut key_block = vec![0u8; SHA256_BLOCK_SIZE];
        key_block[..key.len()].copy_from_slice(&key);

        let mut ipad = key_block.clone();
        for b in &mut ipad {
            *b ^= 0x36;
        }
        let mut opad = key_block;
        for b in &mut opad {
            *b ^= 0x5c;
        }

        let mut inner = inner_factory.create();
        inner.update(&ipad);
        ChainHmac {
            inner_factory,
            inner,
            opad,
        }
    }
}

impl ChainHash for ChainHmac {
    fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        let ChainHmac {
            inner_factory,
            inner,
            opad,
        } = *self;
        let inner_sum = inner.finalize();

        let mut outer = inner_factory.create();
        outer.update(&opad);
        outer.update(&inner_sum);
        outer.finalize()
    }
}

/// Full 32-byte KDF output for `key` under `salt` and extra `path`
/// labels.
pub(crate) fn kdf(key: &[u8], salt: &[u8], path: &[&[u8]]) -> [u8; 32] {
    let mut factory: Arc<dyn ChainHashFactory> = Arc::new(HmacFactory {
        key: KDF_ROOT.to_vec(),
        inner: Arc::new(Sha256Factory),
    });
    factory = Arc::new(HmacFactory {
        key: salt.to_vec(),
        inner: factory,
    });
    for p in path {
        factory = Arc::new(HmacFactory {
            key: p.to_vec(),
            inner: factory,
        });
    }

    let mut h = factory.create();
    h.update(key);
    let out = h.finalize();
    out.try_into()
        .unwrap_or_else(|_| unreachable!("sha256 output size mismatch"))
}

/// First 16 bytes of [`kdf`], the usual AES-128 key / GCM IV slice.
pub(crate) fn kdf16(key: &[u8], salt: &[u8], path: &[&[u8]]) -> [u8; 16] {
    let full = kdf(key, salt, path);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_is_deterministic() {
        let a = kdf(&[1u8; 16], KDF_SALT_AUTH_ID_ENCRYPTION_KEY, &[]);
        let b = kdf(&[1u8; 16], KDF_SALT_AUTH_ID_ENCRYPTION_KEY, &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_kdf_path_changes_output() {
        let plain = kdf(&[1u8; 16], b"salt", &[]);
        let pathed = kdf(&[1u8; 16], b"salt", &[b"extra"]);
        assert_ne!(plain, pathed);
    }

    #[test]
    fn test_kdf16_is_prefix() {
        let full = kdf(&[2u8; 16], b"salt", &[b"a", b"b"]);
        let short = kdf16(&[2u8; 16], b"salt", &[b"a", b"b"]);
        assert_eq!(&full[..16], &short[..]);
    }
}
