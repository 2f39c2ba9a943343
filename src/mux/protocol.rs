//! Mux handshake and per-stream wire types
//!
//! A multiplexed connection starts with a short handshake naming the
//! protocol version, the framing backend, and optional padding. Each
//! logical stream then opens with a [`StreamRequest`] and is answered
//! by a [`StreamResponse`] before payload flows.

use crate::common::net::Address;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Destination marking a connection as multiplexed
pub const MUX_DESTINATION: &str = "sp.mux.sing-box.arpa";
pub const MUX_DESTINATION_PORT: u16 = 444;

pub(crate) const VERSION_PLAIN: u8 = 0;
pub(crate) const VERSION_PADDED: u8 = 1;

const FLAG_UDP: u16 = 0x01;
const FLAG_ADDR: u16 = 0x02;

const MIN_HANDSHAKE_PADDING: u16 = 256;
const HANDSHAKE_PADDING_RANGE: u32 = 512;

/// Framing backend carried in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Smux,
    Yamux,
    H2Mux,
}

impl Protocol {
    pub(crate) fn protocol_byte(self) -> u8 {
        match self {
            Protocol::Smux => 0,
            Protocol::Yamux => 1,
            Protocol::H2Mux => 2,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Protocol::Smux),
            1 => Ok(Protocol::Yamux),
            2 => Ok(Protocol::H2Mux),
            other => Err(Error::protocol(format!("Unknown mux protocol: {}", other))),
        }
    }
}

/// Connection-level handshake
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    pub version: u8,
    pub protocol: Protocol,
    pub padding: bool,
}

impl Handshake {
    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        match self.version {
            VERSION_PLAIN | VERSION_PADDED => {}
            other => return Err(Error::BadVersion(other)),
        }
        out.put_u8(self.version);
        out.put_u8(self.protocol.protocol_byte());
        if self.version >= VERSION_PADDED {
            if self.padding {
                out.put_u8(1);
                let pad_len =
                    MIN_HANDSHAKE_PADDING + (OsRng.next_u32() % HANDSHAKE_PADDING_RANGE) as u16;
                out.put_u16(pad_len);
                let mut padding = vec![0u8; pad_len as usize];
                OsRng.fill_bytes(&mut padding);
                out.put_slice(&padding);
            } else {
                out.put_u8(0);
            }
        }
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u8().await?;
        let protocol = Protocol::from_byte(reader.read_u8().await?)?;
        let padding = match version {
            VERSION_PLAIN => false,
            VERSION_PADDED => {
                if reader.read_u8().await? != 0 {
                    let pad_len = reader.read_u16().await? as usize;
                    let mut padding = vec![0u8; pad_len];
                    reader.read_exact(&mut padding).await?;
                    true
                } else {
                    false
                }
            }
            other => return Err(Error::BadVersion(other)),
        };
        Ok(Handshake {
            version,
            protocol,
            padding,
        })
    }
}

/// Opening request of one logical stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// True for packet streams
    pub udp: bool,
    /// Packet streams that carry a per-packet destination
    pub packet_addr: bool,
    pub destination: Address,
    pub port: u16,
}

impl StreamRequest {
    pub fn tcp(destination: Address, port: u16) -> Self {
        StreamRequest {
            udp: false,
            packet_addr: false,
            destination,
            port,
        }
    }

    pub fn udp(destination: Address, port: u16, packet_addr: bool) -> Self {
        StreamRequest {
            udp: true,
            packet_addr,
            destination,
            port,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        let mut flags = 0u16;
        if self.udp {
            flags |= FLAG_UDP;
        }
        if self.packet_addr {
            flags |= FLAG_ADDR;
        }
        out.put_u16(flags);
        self.destination.write_socks(out, self.port)
    }

    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let flags = reader.read_u16().await?;
        let (destination, port) = read_socks_addr(reader).await?;
        Ok(StreamRequest {
            udp: flags & FLAG_UDP != 0,
            packet_addr: flags & FLAG_ADDR != 0,
            destination,
            port,
        })
    }
}

/// Server answer to a [`StreamRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamResponse {
    Success,
    Failure(String),
}

impl StreamResponse {
    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        match self {
            StreamResponse::Success => out.put_u8(0),
            StreamResponse::Failure(message) => {
                out.put_u8(1);
                let len = u16::try_from(message.len())
                    .map_err(|_| Error::protocol("Mux error message too long"))?;
                out.put_u16(len);
                out.put_slice(message.as_bytes());
            }
        }
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        match reader.read_u8().await? {
            0 => Ok(StreamResponse::Success),
            1 => {
                let len = reader.read_u16().await? as usize;
                let mut message = vec![0u8; len];
                reader.read_exact(&mut message).await?;
                let message = String::from_utf8_lossy(&message).into_owned();
                Ok(StreamResponse::Failure(message))
            }
            other => Err(Error::bad_header(format!(
                "Unknown mux stream status: {}",
                other
            ))),
        }
    }
}

/// Read a SOCKS-form address incrementally from a stream.
pub(crate) async fn read_socks_addr<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(Address, u16)> {
    let atyp = reader.read_u8().await?;
    let addr = match atyp {
        0x01 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Address::Ipv4(octets.into())
        }
        0x04 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            Address::Ipv6(octets.into())
        }
        0x03 => {
            let len = reader.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await?;
            let domain = String::from_utf8(name)
                .map_err(|e| Error::address(format!("Invalid domain: {}", e)))?;
            Address::Domain(domain)
        }
        t => return Err(Error::bad_header(format!("Unknown address type: {}", t))),
    };
    let port = reader.read_u16().await?;
    Ok((addr, port))
}

/// Packet stream: payloads framed with a big-endian u16 length.
pub struct PacketConn<S> {
    inner: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketConn<S> {
    pub fn new(inner: S) -> Self {
        PacketConn { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let len =
            u16::try_from(payload.len()).map_err(|_| Error::protocol("Packet too large"))?;
        self.inner.write_u16(len).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let len = self.inner.read_u16().await? as usize;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        Ok(payload)
    }
}

/// Packet stream variant that carries a destination per packet.
pub struct PacketAddrConn<S> {
    inner: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketAddrConn<S> {
    pub fn new(inner: S) -> Self {
        PacketAddrConn { inner }
    }

    pub async fn write_packet(
        &mut self,
        payload: &[u8],
        destination: &Address,
        port: u16,
    ) -> Result<()> {
        let mut buf = BytesMut::new();
        destination.write_socks(&mut buf, port)?;
        let len =
            u16::try_from(payload.len()).map_err(|_| Error::protocol("Packet too large"))?;
        buf.put_u16(len);
        buf.put_slice(payload);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn read_packet(&mut self) -> Result<(Vec<u8>, Address, u16)> {
        let (addr, port) = read_socks_addr(&mut self.inner).await?;
        let len = self.inner.read_u16().await? as usize;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        Ok((payload, addr, port))
    }
}
