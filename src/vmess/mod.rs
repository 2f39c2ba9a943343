//! VMess record layer
//!
//! Both generations of the protocol: the AEAD handshake (sealed header
//! with an encrypted auth id) and the legacy HMAC-MD5 handshake with
//! AES-CFB headers and alter ids. The body codec lives in [`chunk`],
//! the stream halves in [`stream`], the in-protocol multiplexer in
//! [`mux`].

pub(crate) mod chunk;
pub(crate) mod kdf;
pub mod mux;
pub mod stream;

pub use mux::{MuxClient, MuxServer, MuxStream};
pub use stream::{ClientConfig, ClientStream, Request, Service, ServerStream};

use crate::{Error, Result};
use md5::{Digest as Md5Digest, Md5};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub(crate) const VERSION: u8 = 1;

pub const OPTION_CHUNK_STREAM: u8 = 0x01;
pub const OPTION_CONNECTION_REUSE: u8 = 0x02;
pub const OPTION_CHUNK_MASKING: u8 = 0x04;
pub const OPTION_GLOBAL_PADDING: u8 = 0x08;
pub const OPTION_AUTHENTICATED_LENGTH: u8 = 0x10;

pub(crate) const SECURITY_TYPE_LEGACY: u8 = 1;
pub(crate) const SECURITY_TYPE_AES128_GCM: u8 = 3;
pub(crate) const SECURITY_TYPE_CHACHA20_POLY1305: u8 = 4;
pub(crate) const SECURITY_TYPE_NONE: u8 = 5;
pub(crate) const SECURITY_TYPE_ZERO: u8 = 6;

/// Window, in seconds, inside which an auth id is considered live.
/// Doubles as the replay-filter retention period.
pub(crate) const AUTH_ID_WINDOW: u64 = 120;

const CMD_KEY_SUFFIX: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";
const ALTER_ID_SALT: &[u8] = b"16167dc8-16b6-4e6d-b8bb-65dd68113a81";
const ALTER_ID_RETRY_SALT: &[u8] = b"533eff8a-4113-4b10-b5ce-0f5d76b98cd2";

/// Request command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
    Mux,
}

impl Command {
    pub(crate) fn protocol_byte(self) -> u8 {
        match self {
            Command::Tcp => 1,
            Command::Udp => 2,
            Command::Mux => 3,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Command::Tcp),
            2 => Ok(Command::Udp),
            3 => Ok(Command::Mux),
            other => Err(Error::UnknownCommand(other)),
        }
    }

    /// Mux requests carry no destination; the frames do.
    pub(crate) fn has_address(self) -> bool {
        !matches!(self, Command::Mux)
    }
}

/// Configured security preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Security {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "none")]
    None,
    #[serde(rename = "zero")]
    Zero,
}

impl TryFrom<&str> for Security {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Security::Auto),
            "aes-128-gcm" => Ok(Security::Aes128Gcm),
            "chacha20-poly1305" => Ok(Security::ChaCha20Poly1305),
            "none" => Ok(Security::None),
            "zero" => Ok(Security::Zero),
            _ => Err(Error::protocol(format!("Unknown VMess security: {}", s))),
        }
    }
}

/// Security after resolving `auto` for the local CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolvedSecurity {
    Aes128Gcm,
    ChaCha20Poly1305,
    None,
    Zero,
    Legacy,
}

impl ResolvedSecurity {
    pub(crate) fn protocol_byte(self) -> u8 {
        match self {
            ResolvedSecurity::Aes128Gcm => SECURITY_TYPE_AES128_GCM,
            ResolvedSecurity::ChaCha20Poly1305 => SECURITY_TYPE_CHACHA20_POLY1305,
            ResolvedSecurity::None => SECURITY_TYPE_NONE,
            ResolvedSecurity::Zero => SECURITY_TYPE_ZERO,
            ResolvedSecurity::Legacy => SECURITY_TYPE_LEGACY,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Result<Self> {
        match b {
            SECURITY_TYPE_AES128_GCM => Ok(ResolvedSecurity::Aes128Gcm),
            SECURITY_TYPE_CHACHA20_POLY1305 => Ok(ResolvedSecurity::ChaCha20Poly1305),
            SECURITY_TYPE_NONE => Ok(ResolvedSecurity::None),
            SECURITY_TYPE_ZERO => Ok(ResolvedSecurity::Zero),
            SECURITY_TYPE_LEGACY => Ok(ResolvedSecurity::Legacy),
            other => Err(Error::bad_header(format!("Unknown security type: {}", other))),
        }
    }

    pub(crate) fn is_aead(self) -> bool {
        matches!(
            self,
            ResolvedSecurity::Aes128Gcm | ResolvedSecurity::ChaCha20Poly1305
        )
    }
}

pub(crate) fn resolve_security(security: Security) -> ResolvedSecurity {
    match security {
        Security::Auto => {
            if cfg!(target_arch = "x86_64")
                || cfg!(target_arch = "aarch64")
                || cfg!(target_arch = "s390x")
            {
                ResolvedSecurity::Aes128Gcm
            } else {
                ResolvedSecurity::ChaCha20Poly1305
            }
        }
        Security::Aes128Gcm => ResolvedSecurity::Aes128Gcm,
        Security::ChaCha20Poly1305 => ResolvedSecurity::ChaCha20Poly1305,
        Security::None => ResolvedSecurity::None,
        Security::Zero => ResolvedSecurity::Zero,
    }
}

/// One VMess identity: the account uuid plus its derived key material.
#[derive(Clone)]
pub struct User {
    uuid: Uuid,
    alter_id: u16,
    cmd_key: [u8; 16],
}

impl User {
    pub fn new(uuid: Uuid, alter_id: u16) -> Self {
        User {
            uuid,
            alter_id,
            cmd_key: derive_cmd_key(&uuid),
        }
    }

    pub fn parse(uuid_str: &str, alter_id: u16) -> Result<Self> {
        let uuid = Uuid::parse_str(uuid_str)
            .map_err(|e| Error::key(format!("Invalid VMess UUID: {}", e)))?;
        Ok(User::new(uuid, alter_id))
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn alter_id(&self) -> u16 {
        self.alter_id
    }

    pub(crate) fn cmd_key(&self) -> &[u8; 16] {
        &self.cmd_key
    }

    /// The main uuid plus every alter id, in legacy auth order.
    pub(crate) fn legacy_ids(&self) -> Vec<Uuid> {
        let mut ids = Vec::with_capacity(1 + self.alter_id as usize);
        ids.push(self.uuid);
        let mut prev = self.uuid;
        for _ in 0..self.alter_id {
            prev = next_alter_id(&prev);
            ids.push(prev);
        }
        ids
    }
}

pub(crate) fn derive_cmd_key(uuid: &Uuid) -> [u8; 16] {
    let mut hasher = Md5::new();
    Md5Digest::update(&mut hasher, uuid.as_bytes());
    Md5Digest::update(&mut hasher, CMD_KEY_SUFFIX);
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

/// Derive the next alter id from the previous one. Collisions with the
/// source id re-salt until the chain diverges.
fn next_alter_id(prev: &Uuid) -> Uuid {
    let mut salt: &[u8] = ALTER_ID_SALT;
    loop {
        let mut hasher = Md5::new();
        Md5Digest::update(&mut hasher, prev.as_bytes());
        Md5Digest::update(&mut hasher, salt);
        let digest = hasher.finalize();
        let candidate = Uuid::from_slice(&digest).unwrap_or_else(|_| *prev);
        if candidate != *prev {
            return candidate;
        }
        salt = ALTER_ID_RETRY_SALT;
    }
}

pub(crate) fn fnv1a_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

pub(crate) fn sha256_first16(data: &[u8]) -> [u8; 16] {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

pub(crate) fn md5_16(data: &[u8]) -> [u8; 16] {
    let digest = Md5::digest(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_parse() {
        assert_eq!(Security::try_from("auto").unwrap(), Security::Auto);
        assert_eq!(
            Security::try_from("AES-128-GCM").unwrap(),
            Security::Aes128Gcm
        );
        assert!(Security::try_from("rc4").is_err());
    }

    #[test]
    fn test_resolve_auto_is_aead() {
        assert!(resolve_security(Security::Auto).is_aead());
    }

    #[test]
    fn test_command_round_trip() {
        for cmd in [Command::Tcp, Command::Udp, Command::Mux] {
            assert_eq!(Command::from_byte(cmd.protocol_byte()).unwrap(), cmd);
        }
        assert!(matches!(
            Command::from_byte(9),
            Err(Error::UnknownCommand(9))
        ));
    }

    #[test]
    fn test_cmd_key_is_stable() {
        let user = User::parse("b831381d-6324-4d53-ad4f-8cda48b30811", 0).unwrap();
        assert_eq!(user.cmd_key(), &derive_cmd_key(user.uuid()));
    }

    #[test]
    fn test_legacy_ids_chain() {
        let user = User::parse("b831381d-6324-4d53-ad4f-8cda48b30811", 4).unwrap();
        let ids = user.legacy_ids();
        assert_eq!(ids.len(), 5);
        // All distinct
        for i in 0..ids.len() {
            for j in i + 1..ids.len() {
                assert_ne!(ids[i], ids[j]);
            }
        }
    }

    #[test]
    fn test_fnv1a_known_value() {
        // FNV-1a of empty input is the offset basis.
        assert_eq!(fnv1a_hash(b""), 0x811c9dc5);
        assert_eq!(fnv1a_hash(b"a"), 0xe40c292c);
    }
}
