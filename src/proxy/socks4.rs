//! SOCKS4 and SOCKS4a client protocol
//!
//! A single request/reply exchange: version, CONNECT, the 6-byte
//! port+IPv4 block, the user-id, and for 4a the domain name. Plain
//! SOCKS4 carries only IPv4, so domain targets are resolved locally
//! before the request goes out; SOCKS4a sends the name on the wire
//! behind the `0.0.0.1` sentinel.

use crate::addr::Address;
use crate::error::{Result, SockchainError};
use crate::proxy::Kwargs;
use crate::stream::BoxedStream;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// SOCKS4 protocol version
pub const SOCKS4_VERSION: u8 = 0x04;
/// CONNECT command
pub const SOCKS4_CMD_CONNECT: u8 = 0x01;
/// Request granted
pub const SOCKS4_REPLY_OK: u8 = 90;
/// Request rejected or failed
pub const SOCKS4_REPLY_REJECTED: u8 = 91;

/// SOCKS4/SOCKS4a client hop dialer
#[derive(Debug)]
pub struct Socks4Dialer {
    address: String,
    kwargs: Kwargs,
    user_id: String,
    four_a: bool,
}

impl Socks4Dialer {
    /// Create a dialer for the proxy at `address`. `four_a` selects
    /// the 4a extension, which lets the proxy resolve domain targets.
    pub fn new(address: &str, kwargs: Kwargs, user_id: String, four_a: bool) -> Self {
        Socks4Dialer {
            address: address.to_string(),
            kwargs,
            user_id,
            four_a,
        }
    }

    /// The protocol tag.
    pub fn protocol(&self) -> &str {
        if self.four_a {
            "socks4a"
        } else {
            "socks4"
        }
    }

    /// The transport network used to reach the proxy.
    pub fn network(&self) -> &str {
        "tcp"
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

        let request = self.build_request(&target).await?;
        conn.write_all(&request).await?;

        let mut head = [0u8; 2];
        conn.read_exact(&mut head).await?;
        if head[0] != 0 {
            return Err(SockchainError::Handshake(
                "unknown reply version".to_string(),
            ));
        }
        // the reply's port+IPv4 block is informational only
        let _bound = Address::read_socks4(&mut conn).await?;

        if head[1] != SOCKS4_REPLY_OK {
            return Err(SockchainError::Handshake("request rejected".to_string()));
        }
        debug!("{} {} connected to {}", self.protocol(), self.address, target);

        Ok(conn)
    }

    /// Build the full request: header, address block, user-id, and
    /// for 4a the domain name, each NUL-terminated.
    async fn build_request(&self, target: &Address) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(9 + self.user_id.len());
        buf.push(SOCKS4_VERSION);
        buf.push(SOCKS4_CMD_CONNECT);

        let hostname = if self.four_a {
            target.write_socks4(&mut buf);
            match target {
                Address::Ip(SocketAddr::V4(_)) => None,
                _ => Some(target.host()),
            }
        } else {
            let ip = target.resolve_ipv4().await?;
            buf.extend_from_slice(&target.port().to_be_bytes());
            buf.extend_from_slice(&ip.octets());
            None
        };

        buf.extend_from_slice(self.user_id.as_bytes());
        buf.push(0);
        if let Some(hostname) = hostname {
            buf.extend_from_slice(hostname.as_bytes());
            buf.push(0);
        }

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncRead, AsyncWrite};

    fn dialer(four_a: bool, user_id: &str) -> Socks4Dialer {
        Socks4Dialer::new("127.0.0.1:1080", Kwargs::new(), user_id.to_string(), four_a)
    }

    fn ok_reply() -> Vec<u8> {
        vec![0, SOCKS4_REPLY_OK, 0, 0, 0, 0, 0, 0]
    }

    async fn expect_request<S>(stream: &mut S, expected: &[u8])
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; expected.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_socks4_request_wire_format() {
        let (client, mut server) = duplex(256);

        let handle = tokio::spawn(async move {
            let expected = [
                &[4u8, 1][..],
                &80u16.to_be_bytes(),
                &[10, 0, 0, 1],
                b"id",
                &[0],
            ]
            .concat();
            expect_request(&mut server, &expected).await;
            server.write_all(&ok_reply()).await.unwrap();
        });

        dialer(false, "id")
            .dial_over(Box::new(client), "tcp", "10.0.0.1:80")
            .await
            .unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks4a_sends_domain_after_user_id() {
        let (client, mut server) = duplex(256);

        let handle = tokio::spawn(async move {
            let expected = [
                &[4u8, 1][..],
                &443u16.to_be_bytes(),
                &[0, 0, 0, 1],
                &[0],
                b"example.com",
                &[0],
            ]
            .concat();
            expect_request(&mut server, &expected).await;
            server.write_all(&ok_reply()).await.unwrap();
        });

        dialer(true, "")
            .dial_over(Box::new(client), "tcp", "example.com:443")
            .await
            .unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks4a_ip_target_has_no_trailing_name() {
        let (client, mut server) = duplex(256);

        let handle = tokio::spawn(async move {
            let expected = [
                &[4u8, 1][..],
                &80u16.to_be_bytes(),
                &[192, 168, 0, 1],
                &[0],
            ]
            .concat();
            expect_request(&mut server, &expected).await;
            server.write_all(&ok_reply()).await.unwrap();
        });

        dialer(true, "")
            .dial_over(Box::new(client), "tcp", "192.168.0.1:80")
            .await
            .unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_reply() {
        let (client, mut server) = duplex(256);

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 9];
            server.read_exact(&mut buf).await.unwrap();
            server
                .write_all(&[0, SOCKS4_REPLY_REJECTED, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = dialer(false, "")
            .dial_over(Box::new(client), "tcp", "10.0.0.1:80")
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("request rejected"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_reply_version() {
        let (client, mut server) = duplex(256);

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 9];
            server.read_exact(&mut buf).await.unwrap();
            server
                .write_all(&[4, SOCKS4_REPLY_OK, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = dialer(false, "")
            .dial_over(Box::new(client), "tcp", "10.0.0.1:80")
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("unknown reply version"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks4_rejects_ipv6_target() {
        let (client, _server) = duplex(64);
        let err = dialer(false, "")
            .dial_over(Box::new(client), "tcp", "[::1]:80")
            .await
            .unwrap_err();
        assert!(matches!(err, SockchainError::Resolve(_)));
    }

    #[tokio::test]
    async fn test_rejects_non_tcp_target() {
        let (client, _server) = duplex(64);
        let err = dialer(false, "")
            .dial_over(Box::new(client), "udp", "10.0.0.1:80")
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("tcp only"));
    }
}
