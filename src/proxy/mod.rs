//! Proxy chains and the dialers compiled from them
//!
//! A [`ProxyInfo`] is one parsed hop specification; a [`Chain`] is an
//! ordered sequence of them. Compiling a chain yields a
//! [`chain::ChainDialer`] over per-protocol [`HopDialer`]s, each of
//! which knows how to run its client handshake over an established
//! connection.

pub mod chain;
pub mod shadowsocks;
pub mod socks4;
pub mod socks5;

pub use chain::ChainDialer;
pub use shadowsocks::ShadowsocksDialer;
pub use socks4::Socks4Dialer;
pub use socks5::Socks5Dialer;

use crate::error::{Result, SockchainError};
use crate::stream::BoxedStream;
use std::collections::BTreeMap;
use std::fmt;

/// String-keyed options attached to a hop
pub type Kwargs = BTreeMap<String, String>;

/// One hop specification from a chain description line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    /// Protocol tag (`socks4`, `socks4a`, `socks5`, `socks5h`, `ss`),
    /// or a directive name during parsing
    pub protocol: String,
    /// `host:port` or a unix socket path
    pub address: String,
    /// Positional, per-protocol arguments
    pub args: Vec<String>,
    /// Options inherited from the line's working kwargs
    pub kwargs: Kwargs,
}

impl ProxyInfo {
    /// Whether this entry is a `set`/`unset`/`clear` directive rather
    /// than a hop.
    pub(crate) fn is_directive(&self) -> bool {
        matches!(self.protocol.as_str(), "set" | "unset" | "clear")
    }

    /// Compile this hop into its protocol dialer.
    pub fn to_dialer(&self) -> Result<HopDialer> {
        match self.protocol.as_str() {
            "socks5" | "socks5h" => self.to_socks5(),
            "socks4" | "socks4a" => self.to_socks4(),
            "ss" => self.to_shadowsocks(),
            other => Err(SockchainError::Config(format!(
                "cannot convert {other} to dialer"
            ))),
        }
    }

    fn to_socks5(&self) -> Result<HopDialer> {
        let (username, password) = match self.args.len() {
            0 => (None, None),
            1 => (Some(self.args[0].clone()), None),
            2 => (Some(self.args[0].clone()), Some(self.args[1].clone())),
            _ => return Err(self.invalid_options()),
        };
        Ok(HopDialer::Socks5(Socks5Dialer::new(
            network_for(&self.address),
            &self.address,
            self.kwargs.clone(),
            username,
            password,
        )))
    }

    fn to_socks4(&self) -> Result<HopDialer> {
        if self.args.len() > 1 {
            return Err(self.invalid_options());
        }
        let user_id = self.args.first().cloned().unwrap_or_default();
        Ok(HopDialer::Socks4(Socks4Dialer::new(
            &self.address,
            self.kwargs.clone(),
            user_id,
            self.protocol == "socks4a",
        )))
    }

    fn to_shadowsocks(&self) -> Result<HopDialer> {
        let mut method = "chacha20-ietf-poly1305";
        let mut password = "";
        match self.args.len() {
            0 => {}
            1 => method = &self.args[0],
            2 => {
                method = &self.args[0];
                password = &self.args[1];
            }
            _ => return Err(self.invalid_options()),
        }
        Ok(HopDialer::Shadowsocks(ShadowsocksDialer::new(
            network_for(&self.address),
            &self.address,
            self.kwargs.clone(),
            method,
            password,
        )?))
    }

    fn invalid_options(&self) -> SockchainError {
        SockchainError::Config(format!("{}: invalid proxy options", self.protocol))
    }
}

impl fmt::Display for ProxyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.protocol)?;
        if !self.address.is_empty() {
            write!(f, " {}", self.address)?;
        }
        for arg in &self.args {
            write!(f, " {:?}", arg)?;
        }
        for (key, value) in &self.kwargs {
            write!(f, " {}={:?}", key, value)?;
        }
        Ok(())
    }
}

/// An ordered, immutable sequence of hops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain {
    hops: Vec<ProxyInfo>,
}

impl Chain {
    /// Build a chain from parsed hops.
    pub fn new(hops: Vec<ProxyInfo>) -> Self {
        Chain { hops }
    }

    /// The hops in traversal order.
    pub fn hops(&self) -> &[ProxyInfo] {
        &self.hops
    }

    /// The entry hop, which also carries chain-scoped options.
    pub fn first(&self) -> Option<&ProxyInfo> {
        self.hops.first()
    }

    /// Number of hops.
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Whether the chain has no hops.
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Compile every hop and assemble the chain dialer.
    pub fn to_dialer(&self) -> Result<ChainDialer> {
        let mut dialers = Vec::with_capacity(self.hops.len());
        for hop in &self.hops {
            dialers.push(hop.to_dialer()?);
        }
        Ok(ChainDialer::new(dialers))
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, hop) in self.hops.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", hop)?;
        }
        Ok(())
    }
}

/// Hop addresses containing `/` are unix socket paths.
fn network_for(address: &str) -> &'static str {
    if address.contains('/') {
        "unix"
    } else {
        "tcp"
    }
}

/// A compiled per-protocol hop dialer
///
/// Every variant can run its client protocol over an established
/// connection, tunneling a CONNECT to the given next target.
#[derive(Debug)]
pub enum HopDialer {
    /// SOCKS4 or SOCKS4a client
    Socks4(Socks4Dialer),
    /// SOCKS5 client
    Socks5(Socks5Dialer),
    /// Shadowsocks AEAD client
    Shadowsocks(ShadowsocksDialer),
}

impl HopDialer {
    /// The protocol tag this hop was configured with.
    pub fn protocol(&self) -> &str {
        match self {
            HopDialer::Socks4(d) => d.protocol(),
            HopDialer::Socks5(d) => d.protocol(),
            HopDialer::Shadowsocks(d) => d.protocol(),
        }
    }

    /// The transport network used to reach this hop.
    pub fn network(&self) -> &str {
        match self {
            HopDialer::Socks4(d) => d.network(),
            HopDialer::Socks5(d) => d.network(),
            HopDialer::Shadowsocks(d) => d.network(),
        }
    }

    /// The hop's own address.
    pub fn address(&self) -> &str {
        match self {
            HopDialer::Socks4(d) => d.address(),
            HopDialer::Socks5(d) => d.address(),
            HopDialer::Shadowsocks(d) => d.address(),
        }
    }

    /// The hop's options.
    pub fn kwargs(&self) -> &Kwargs {
        match self {
            HopDialer::Socks4(d) => d.kwargs(),
            HopDialer::Socks5(d) => d.kwargs(),
            HopDialer::Shadowsocks(d) => d.kwargs(),
        }
    }

    /// Run this hop's client protocol over `conn`, asking it to
    /// connect to `address` on `network`. Returns the connection to
    /// use for the next hop.
    pub async fn dial_over(
        &self,
        conn: BoxedStream,
        network: &str,
        address: &str,
    ) -> Result<BoxedStream> {
        match self {
            HopDialer::Socks4(d) => d.dial_over(conn, network, address).await,
            HopDialer::Socks5(d) => d.dial_over(conn, network, address).await,
            HopDialer::Shadowsocks(d) => d.dial_over(conn, network, address).await,
        }
    }
}
