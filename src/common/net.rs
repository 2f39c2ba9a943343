//! Address types and wire serialisers
//!
//! Two address encodings coexist on the wire and must never be mixed:
//!
//! - SOCKS form: family tag `0x01`=IPv4, `0x04`=IPv6, `0x03`=domain,
//!   port written after the address. Used by Shadowsocks (both
//!   generations) and mux stream requests.
//! - VMess form: family tag `0x01`=IPv4, `0x03`=IPv6, `0x02`=domain.
//!   The request header writes the port before the address; mini-mux
//!   frames write the address before the port.

use crate::{Error, Result};
use bytes::{Buf, BufMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

const VMESS_ATYP_IPV4: u8 = 0x01;
const VMESS_ATYP_DOMAIN: u8 = 0x02;
const VMESS_ATYP_IPV6: u8 = 0x03;

/// Destination address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Serialised length in SOCKS form (tag + address + port)
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 1 + 4 + 2,
            Address::Ipv6(_) => 1 + 16 + 2,
            Address::Domain(d) => 1 + 1 + d.len() + 2,
        }
    }

    fn check_domain(domain: &str) -> Result<()> {
        if domain.len() > 255 {
            return Err(Error::address("Domain name too long"));
        }
        Ok(())
    }

    /// Write in SOCKS form: tag, address, port
    pub fn write_socks<B: BufMut>(&self, buf: &mut B, port: u16) -> Result<()> {
        match self {
            Address::Ipv4(ip) => {
                buf.put_u8(SOCKS_ATYP_IPV4);
                buf.put_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.put_u8(SOCKS_ATYP_IPV6);
                buf.put_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                Self::check_domain(domain)?;
                buf.put_u8(SOCKS_ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
        buf.put_u16(port);
        Ok(())
    }

    /// Read SOCKS form from a buffer
    pub fn read_socks<B: Buf>(buf: &mut B) -> Result<(Self, u16)> {
        if buf.remaining() < 1 {
            return Err(Error::bad_header("Short address"));
        }
        let atyp = buf.get_u8();
        let addr = match atyp {
            SOCKS_ATYP_IPV4 => {
                if buf.remaining() < 4 + 2 {
                    return Err(Error::bad_header("Short IPv4 address"));
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Address::Ipv4(Ipv4Addr::from(octets))
            }
            SOCKS_ATYP_IPV6 => {
                if buf.remaining() < 16 + 2 {
                    return Err(Error::bad_header("Short IPv6 address"));
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Address::Ipv6(Ipv6Addr::from(octets))
            }
            SOCKS_ATYP_DOMAIN => {
                if buf.remaining() < 1 {
                    return Err(Error::bad_header("Short domain address"));
                }
                let len = buf.get_u8() as usize;
                if buf.remaining() < len + 2 {
                    return Err(Error::bad_header("Short domain address"));
                }
                let mut name = vec![0u8; len];
                buf.copy_to_slice(&mut name);
                let domain = String::from_utf8(name)
                    .map_err(|e| Error::address(format!("Invalid domain: {}", e)))?;
                Address::Domain(domain)
            }
            t => return Err(Error::bad_header(format!("Unknown address type: {}", t))),
        };
        let port = buf.get_u16();
        Ok((addr, port))
    }

    /// Write in VMess request-header form: port, tag, address
    pub fn write_vmess_port_addr<B: BufMut>(&self, buf: &mut B, port: u16) -> Result<()> {
        buf.put_u16(port);
        self.write_vmess_addr(buf)
    }

    /// Write in VMess mini-mux form: tag, address, port
    pub fn write_vmess_addr_port<B: BufMut>(&self, buf: &mut B, port: u16) -> Result<()> {
        self.write_vmess_addr(buf)?;
        buf.put_u16(port);
        Ok(())
    }

    fn write_vmess_addr<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Address::Ipv4(ip) => {
                buf.put_u8(VMESS_ATYP_IPV4);
                buf.put_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.put_u8(VMESS_ATYP_IPV6);
                buf.put_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                Self::check_domain(domain)?;
                buf.put_u8(VMESS_ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
        Ok(())
    }

    fn read_vmess_addr<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(Error::bad_header("Short address"));
        }
        let atyp = buf.get_u8();
        match atyp {
            VMESS_ATYP_IPV4 => {
                if buf.remaining() < 4 {
                    return Err(Error::bad_header("Short IPv4 address"));
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Ok(Address::Ipv4(Ipv4Addr::from(octets)))
            }
            VMESS_ATYP_IPV6 => {
                if buf.remaining() < 16 {
                    return Err(Error::bad_header("Short IPv6 address"));
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Ok(Address::Ipv6(Ipv6Addr::from(octets)))
            }
            VMESS_ATYP_DOMAIN => {
                if buf.remaining() < 1 {
                    return Err(Error::bad_header("Short domain address"));
                }
                let len = buf.get_u8() as usize;
                if buf.remaining() < len {
                    return Err(Error::bad_header("Short domain address"));
                }
                let mut name = vec![0u8; len];
                buf.copy_to_slice(&mut name);
                let domain = String::from_utf8(name)
                    .map_err(|e| Error::address(format!("Invalid domain: {}", e)))?;
                Ok(Address::Domain(domain))
            }
            t => Err(Error::bad_header(format!("Unknown address type: {}", t))),
        }
    }

    /// Read VMess request-header form: port, tag, address
    pub fn read_vmess_port_addr<B: Buf>(buf: &mut B) -> Result<(Self, u16)> {
        if buf.remaining() < 2 {
            return Err(Error::bad_header("Short address"));
        }
        let port = buf.get_u16();
        let addr = Self::read_vmess_addr(buf)?;
        Ok((addr, port))
    }

    /// Read VMess mini-mux form: tag, address, port
    pub fn read_vmess_addr_port<B: Buf>(buf: &mut B) -> Result<(Self, u16)> {
        let addr = Self::read_vmess_addr(buf)?;
        if buf.remaining() < 2 {
            return Err(Error::bad_header("Short address"));
        }
        let port = buf.get_u16();
        Ok((addr, port))
    }

    /// Get as IP if not a domain
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }

    /// Host portion as a string
    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }

    /// String representation with port
    pub fn to_string_with_port(&self, port: u16) -> String {
        match self {
            Address::Ipv6(ip) => format!("[{}]:{}", ip, port),
            other => format!("{}:{}", other.to_host(), port),
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Address::Ipv4(ip)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Address::Ipv6(ip)
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<String> for Address {
    fn from(host: String) -> Self {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Address::Ipv4(ip);
        }
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            return Address::Ipv6(ip);
        }
        Address::Domain(host)
    }
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        Address::from(host.to_string())
    }
}
