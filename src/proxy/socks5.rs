//! SOCKS5 client protocol
//!
//! Runs the RFC 1928 client side over an established connection:
//! method negotiation, optional RFC 1929 username/password
//! sub-negotiation, then a CONNECT request. The protocol constants
//! here are shared with the inbound server.

use crate::addr::Address;
use crate::error::{ReplyError, Result, SockchainError};
use crate::proxy::Kwargs;
use crate::stream::BoxedStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;
/// Username/password sub-negotiation version
pub const SOCKS5_AUTH_VERSION: u8 = 0x01;

/// No authentication required
pub const SOCKS5_METHOD_NO_AUTH: u8 = 0x00;
/// Username/password authentication
pub const SOCKS5_METHOD_USERPASS: u8 = 0x02;
/// No acceptable methods
pub const SOCKS5_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

/// TCP CONNECT command
pub const SOCKS5_CMD_CONNECT: u8 = 0x01;

/// Reserved byte value (always 0x00)
pub const SOCKS5_RESERVED: u8 = 0x00;

/// Reply code for success
pub const SOCKS5_REPLY_OK: u8 = 0x00;

/// SOCKS5 client hop dialer
#[derive(Debug)]
pub struct Socks5Dialer {
    network: &'static str,
    address: String,
    kwargs: Kwargs,
    methods: Vec<u8>,
    username: Option<String>,
    password: Option<String>,
}

impl Socks5Dialer {
    /// Create a dialer for the proxy at `address`. Supplying a
    /// username additionally offers username/password authentication.
    pub fn new(
        network: &'static str,
        address: &str,
        kwargs: Kwargs,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        let mut methods = vec![SOCKS5_METHOD_NO_AUTH];
        if username.is_some() {
            methods.push(SOCKS5_METHOD_USERPASS);
        }
        Socks5Dialer {
            network,
            address: address.to_string(),
            kwargs,
            methods,
            username,
            password,
        }
    }

    /// The protocol tag.
    pub fn protocol(&self) -> &str {
        "socks5"
    }

    /// The transport network used to reach the proxy.
    pub fn network(&self) -> &str {
        self.network
    }

    /// The proxy's address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The hop's options.
    pub fn kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    /// Run the client handshake over `conn`, requesting a CONNECT to
    /// `address`.
    pub async fn dial_over(
        &self,
        mut conn: BoxedStream,
        network: &str,
        address: &str,
    ) -> Result<BoxedStream> {
        if network != "tcp" {
            return Err(SockchainError::Handshake("tcp only".to_string()));
        }
        let target = Address::parse(address)?;

        let method = self.negotiate_method(&mut conn).await?;
        if method == SOCKS5_METHOD_USERPASS {
            self.authenticate(&mut conn).await?;
        }

        let bound = self.request(&mut conn, &target).await?;
        debug!("socks5 {} connected to {} (bound {})", self.address, target, bound);

        Ok(conn)
    }

    /// Offer our methods and validate the server's selection.
    async fn negotiate_method<S>(&self, stream: &mut S) -> Result<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&method_request(&self.methods)?).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS5_VERSION {
            return Err(SockchainError::Handshake("unknown version".to_string()));
        }

        let method = reply[1];
        if method == SOCKS5_METHOD_NOT_ACCEPTABLE {
            return Err(SockchainError::Handshake(
                "no acceptable methods".to_string(),
            ));
        }
        if !self.methods.contains(&method) {
            return Err(SockchainError::Handshake("unsupported method".to_string()));
        }

        Ok(method)
    }

    /// RFC 1929 username/password sub-negotiation.
    async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let username = self.username.as_deref().unwrap_or_default();
        let password = self.password.as_deref().unwrap_or_default();
        if username.len() > u8::MAX as usize || password.len() > u8::MAX as usize {
            return Err(SockchainError::Handshake(
                "username/password is too big".to_string(),
            ));
        }

        let mut buf = Vec::with_capacity(3 + username.len() + password.len());
        buf.push(SOCKS5_AUTH_VERSION);
        buf.push(username.len() as u8);
        buf.extend_from_slice(username.as_bytes());
        buf.push(password.len() as u8);
        buf.extend_from_slice(password.as_bytes());
        stream.write_all(&buf).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS5_AUTH_VERSION {
            return Err(SockchainError::Handshake(
                "unknown username/password version".to_string(),
            ));
        }
        if reply[1] != 0x00 {
            return Err(SockchainError::Handshake(
                "invalid username/password".to_string(),
            ));
        }

        Ok(())
    }

    /// Send the CONNECT request and read the reply, returning the
    /// server's bound address.
    async fn request<S>(&self, stream: &mut S, target: &Address) -> Result<Address>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, SOCKS5_RESERVED];
        buf.extend_from_slice(&target.to_socks5_bytes()?);
        stream.write_all(&buf).await?;

        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(SockchainError::Handshake("unknown version".to_string()));
        }
        if head[2] != SOCKS5_RESERVED {
            return Err(SockchainError::Handshake("invalid rsv".to_string()));
        }

        let bound = Address::read_socks5(stream).await?;
        if let Some(err) = ReplyError::from_code(head[1]) {
            return Err(err.into());
        }

        Ok(bound)
    }
}

/// Encode the method negotiation request for an offered method list.
fn method_request(methods: &[u8]) -> Result<Vec<u8>> {
    if methods.is_empty() {
        return Err(SockchainError::Handshake("no methods".to_string()));
    }
    if methods.len() > u8::MAX as usize {
        return Err(SockchainError::Handshake("too many methods".to_string()));
    }
    let mut buf = Vec::with_capacity(2 + methods.len());
    buf.push(SOCKS5_VERSION);
    buf.push(methods.len() as u8);
    buf.extend_from_slice(methods);
    Ok(buf)
}
