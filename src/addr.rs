//! Proxy target addresses and their wire encodings
//!
//! An [`Address`] is the destination of a CONNECT request: an IP socket
//! address or a domain name plus port. This module also implements the
//! two wire layouts the proxy protocols use:
//!
//! - SOCKS5: `ATYP` byte, then a 4-byte IPv4, 16-byte IPv6, or
//!   length-prefixed domain, then a big-endian port.
//! - SOCKS4: big-endian port, then a 4-byte IPv4. The 4a extension
//!   signals a trailing domain name with the sentinel IP `0.0.0.1`.

use crate::error::{Result, SockchainError};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// SOCKS5 address type: IPv4
pub const ATYP_IPV4: u8 = 0x01;
/// SOCKS5 address type: domain name
pub const ATYP_DOMAIN: u8 = 0x03;
/// SOCKS5 address type: IPv6
pub const ATYP_IPV6: u8 = 0x04;

/// Maximum length of a domain name on the SOCKS5 wire
pub const MAX_DOMAIN_LEN: usize = 255;

/// The sentinel IPv4 address that marks a SOCKS4a request
pub const SOCKS4A_SENTINEL: [u8; 4] = [0, 0, 0, 1];

/// Target address for proxy requests
///
/// Can be an IP address (v4 or v6) or a domain name, always paired
/// with a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IP address with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Parse a `host:port` string, classifying the host as IPv4, IPv6
    /// (bracketed), or a domain name.
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(sa));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SockchainError::Config(format!("invalid address `{s}`: missing port")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| SockchainError::Config(format!("invalid address `{s}`: bad port")))?;

        if host.is_empty() || host.contains(':') || host.contains('[') {
            return Err(SockchainError::Config(format!("invalid address `{s}`")));
        }
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)));
        }
        if host.len() > MAX_DOMAIN_LEN {
            return Err(SockchainError::Config(format!(
                "invalid address `{s}`: hostname length is too big"
            )));
        }

        Ok(Address::Domain(host.to_string(), port))
    }

    /// The port number.
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(sa) => sa.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// The host part without port or brackets.
    pub fn host(&self) -> String {
        match self {
            Address::Ip(sa) => sa.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// The SOCKS5 address type byte for this address.
    pub fn atyp(&self) -> u8 {
        match self {
            Address::Ip(SocketAddr::V4(_)) => ATYP_IPV4,
            Address::Ip(SocketAddr::V6(_)) => ATYP_IPV6,
            Address::Domain(_, _) => ATYP_DOMAIN,
        }
    }

    /// Encode in the SOCKS5 wire layout: ATYP, address, big-endian port.
    pub fn to_socks5_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(1 + MAX_DOMAIN_LEN + 2);
        match self {
            Address::Ip(SocketAddr::V4(sa)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&sa.ip().octets());
            }
            Address::Ip(SocketAddr::V6(sa)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&sa.ip().octets());
            }
            Address::Domain(domain, _) => {
                if domain.len() > MAX_DOMAIN_LEN {
                    return Err(SockchainError::Handshake(
                        "hostname length is too big".to_string(),
                    ));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(buf)
    }

    /// Decode a SOCKS5 wire address from a stream.
    pub async fn read_socks5<R>(stream: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut atyp = [0u8; 1];
        stream.read_exact(&mut atyp).await?;

        let addr = match atyp[0] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                let port = read_port(stream).await?;
                Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                let port = read_port(stream).await?;
                Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let len = len[0] as usize;
                if len == 0 {
                    return Err(SockchainError::Handshake("invalid domain length".to_string()));
                }
                let mut domain = vec![0u8; len];
                stream.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| SockchainError::Handshake("invalid domain name".to_string()))?;
                let port = read_port(stream).await?;
                Address::Domain(domain, port)
            }
            other => {
                return Err(SockchainError::Handshake(format!(
                    "invalid address type {other:#04x}"
                )))
            }
        };

        Ok(addr)
    }

    /// Encode the 6-byte SOCKS4 address block: big-endian port, then
    /// the IPv4 octets. Domain and IPv6 targets get the `0.0.0.1`
    /// sentinel; the caller appends the name after the user-id NUL.
    pub fn write_socks4(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.port().to_be_bytes());
        match self {
            Address::Ip(SocketAddr::V4(sa)) => buf.extend_from_slice(&sa.ip().octets()),
            _ => buf.extend_from_slice(&SOCKS4A_SENTINEL),
        }
    }

    /// Decode the 6-byte SOCKS4 address block from a stream.
    pub async fn read_socks4<R>(stream: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut block = [0u8; 6];
        stream.read_exact(&mut block).await?;
        let port = u16::from_be_bytes([block[0], block[1]]);
        let ip = Ipv4Addr::new(block[2], block[3], block[4], block[5]);
        Ok(Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)))
    }

    /// Resolve this address to an IPv4 host address.
    ///
    /// IPv4 addresses return immediately; domain names go through the
    /// resolver and the first IPv4 record wins. IPv6 targets and
    /// domains without an A record fail.
    pub async fn resolve_ipv4(&self) -> Result<Ipv4Addr> {
        match self {
            Address::Ip(SocketAddr::V4(sa)) => Ok(*sa.ip()),
            Address::Ip(SocketAddr::V6(_)) => Err(SockchainError::Resolve(
                "could not get ipv4 of hostname".to_string(),
            )),
            Address::Domain(domain, port) => {
                let addrs = tokio::net::lookup_host((domain.as_str(), *port)).await?;
                for resolved in addrs {
                    if let SocketAddr::V4(sa) = resolved {
                        return Ok(*sa.ip());
                    }
                }
                Err(SockchainError::Resolve(
                    "could not get ipv4 of hostname".to_string(),
                ))
            }
        }
    }
}

async fn read_port<R>(stream: &mut R) -> Result<u16>
where
    R: AsyncRead + Unpin,
{
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(sa) => write!(f, "{}", sa),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(sa: SocketAddr) -> Self {
        Address::Ip(sa)
    }
}
