//! Relaykit - cryptographic record layers and stream multiplexing
//!
//! Building blocks for proxy tooling:
//! - Shadowsocks AEAD and Shadowsocks-2022 stream/packet codecs
//! - VMess record layer (AEAD and legacy) with its mini-mux sub-protocol
//! - A standalone mux session layer with connection pooling
//!
//! The crate never opens sockets. Every codec is generic over an
//! `AsyncRead + AsyncWrite` transport supplied by the caller, so the same
//! code runs over TCP, TLS, or an in-memory duplex in tests.
//!
//! # Architecture
//!
//! ```text
//!  +--------------+   +-----------------+   +-----------+
//!  | shadowsocks/ |   | shadowsocks2022/|   |  vmess/   |
//!  |  (AEAD)      |   |  stream+packet  |   | (+minimux)|
//!  +------+-------+   +--------+--------+   +-----+-----+
//!         |                    |                  |
//!         +---------+----------+---------+--------+
//!                   |                    |
//!            +------v------+      +------v------+
//!            |   chunk/    |      |    mux/     |
//!            |   replay/   |      |  (sessions) |
//!            |   crypto/   |      +-------------+
//!            +-------------+
//! ```

pub mod chunk;
pub mod common;
pub mod crypto;
pub mod mux;
pub mod replay;
pub mod shadowsocks;
pub mod shadowsocks2022;
pub mod vmess;

pub use common::clock::{Clock, SystemClock};
pub use common::error::{Error, Result};
pub use common::net::Address;
