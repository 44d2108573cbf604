//! Inbound SOCKS5 server
//!
//! Accepts local clients and runs the server half of the SOCKS5
//! handshake to find out where they want to go. Only NoAuth clients
//! and the CONNECT command are served; the dispatcher takes over once
//! the target address is known.

use crate::addr::Address;
use crate::error::{ReplyError, Result, SockchainError};
use crate::proxy::socks5::{
    SOCKS5_CMD_CONNECT, SOCKS5_METHOD_NO_AUTH, SOCKS5_REPLY_OK, SOCKS5_RESERVED, SOCKS5_VERSION,
};
use crate::stream::BoxedStream;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::Notify;

/// An accepted, not yet handshaken client connection
pub struct ClientConn {
    /// The client's stream
    pub stream: BoxedStream,
    /// Peer description for logging
    pub peer: String,
    /// Local address of the accepted socket, used as the bound
    /// address in replies
    pub local: Option<SocketAddr>,
}

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Listening SOCKS5 server
///
/// `close` may be called from another task; a second close reports
/// "already closed". Accepts in flight observe the close and fail.
pub struct Server {
    listener: ListenerKind,
    closed: RwLock<bool>,
    notify: Notify,
}

impl Server {
    /// Bind a listener on `network` (`tcp` or `unix`) at `address`.
    pub async fn listen(network: &str, address: &str) -> Result<Server> {
        let listener = match network {
            "tcp" => ListenerKind::Tcp(TcpListener::bind(address).await.map_err(|e| {
                SockchainError::Server(format!("failed to listen on {network} {address}: {e}"))
            })?),
            #[cfg(unix)]
            "unix" => ListenerKind::Unix(UnixListener::bind(address).map_err(|e| {
                SockchainError::Server(format!("failed to listen on {network} {address}: {e}"))
            })?),
            other => {
                return Err(SockchainError::Server(format!(
                    "unsupported listen network `{other}`"
                )))
            }
        };
        Ok(Server {
            listener,
            closed: RwLock::new(false),
            notify: Notify::new(),
        })
    }

    /// The listener's local address, when it has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            ListenerKind::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            ListenerKind::Unix(_) => None,
        }
    }

    /// Accept one client connection.
    pub async fn accept(&self) -> Result<ClientConn> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed() {
            return Err(SockchainError::Server("server is closed".to_string()));
        }

        tokio::select! {
            _ = notified => Err(SockchainError::Server("server is closed".to_string())),
            conn = accept_inner(&self.listener) => conn,
        }
    }

    /// Stop accepting. Safe to call from any task; a second call
    /// reports an error.
    pub fn close(&self) -> Result<()> {
        let mut closed = self
            .closed
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *closed {
            return Err(SockchainError::Server(
                "server is already closed".to_string(),
            ));
        }
        *closed = true;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        *self
            .closed
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn accept_inner(listener: &ListenerKind) -> Result<ClientConn> {
    match listener {
        ListenerKind::Tcp(listener) => {
            let (stream, peer) = listener.accept().await?;
            let local = stream.local_addr().ok();
            Ok(ClientConn {
                stream: Box::new(stream),
                peer: peer.to_string(),
                local,
            })
        }
        #[cfg(unix)]
        ListenerKind::Unix(listener) => {
            let (stream, _) = listener.accept().await?;
            Ok(ClientConn {
                stream: Box::new(stream),
                peer: "unix".to_string(),
                local: None,
            })
        }
    }
}

/// Run the server half of the SOCKS5 handshake and return the target
/// address the client asked for.
///
/// The client must offer NoAuth and send a CONNECT; anything else
/// fails the handshake (non-CONNECT commands are answered with a
/// command-not-supported reply first).
pub async fn handshake<S>(stream: &mut S, local: Option<SocketAddr>) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // method negotiation
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(SockchainError::Handshake(
            "unknown method version".to_string(),
        ));
    }
    let count = head[1] as usize;
    if count == 0 {
        return Err(SockchainError::Handshake("no methods".to_string()));
    }
    let mut methods = vec![0u8; count];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&SOCKS5_METHOD_NO_AUTH) {
        return Err(SockchainError::Handshake(
            "no supported methods".to_string(),
        ));
    }
    stream
        .write_all(&[SOCKS5_VERSION, SOCKS5_METHOD_NO_AUTH])
        .await?;

    // request
    let mut request = [0u8; 3];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS5_VERSION {
        return Err(SockchainError::Handshake(
            "unknown request version".to_string(),
        ));
    }
    if request[2] != SOCKS5_RESERVED {
        return Err(SockchainError::Handshake("invalid rsv".to_string()));
    }
    if request[1] != SOCKS5_CMD_CONNECT {
        reply(stream, ReplyError::CmdNotSupported.code(), local).await?;
        return Err(ReplyError::CmdNotSupported.into());
    }

    let target = Address::read_socks5(stream)
        .await
        .map_err(|_| SockchainError::Handshake("failed to read address".to_string()))?;

    reply(stream, SOCKS5_REPLY_OK, local).await?;

    Ok(target)
}

/// Send a SOCKS5 reply with the given code and bound address.
async fn reply<S>(stream: &mut S, code: u8, bound: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut buf = vec![SOCKS5_VERSION, code, SOCKS5_RESERVED];
    buf.extend_from_slice(&Address::from(bound).to_socks5_bytes()?);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn client_side<S>(mut stream: S, request: Vec<u8>) -> Vec<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&request).await.unwrap();
        let mut response = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
            }
        }
        response
    }

    fn connect_request(addr: &[u8]) -> Vec<u8> {
        let mut request = vec![SOCKS5_VERSION, 1, SOCKS5_METHOD_NO_AUTH];
        request.extend_from_slice(&[SOCKS5_VERSION, SOCKS5_CMD_CONNECT, SOCKS5_RESERVED]);
        request.extend_from_slice(addr);
        request
    }

    #[tokio::test]
    async fn test_handshake_extracts_target() {
        let (mut server_end, client_end) = duplex(512);

        let addr = [&[0x01u8][..], &[93, 184, 216, 34], &80u16.to_be_bytes()].concat();
        let client = tokio::spawn(client_side(client_end, connect_request(&addr)));

        let local: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let target = handshake(&mut server_end, Some(local)).await.unwrap();
        assert_eq!(target, Address::parse("93.184.216.34:80").unwrap());
        drop(server_end);

        let response = client.await.unwrap();
        // method selection, then a success reply bound to our local address
        assert_eq!(&response[..2], &[SOCKS5_VERSION, SOCKS5_METHOD_NO_AUTH]);
        assert_eq!(response[2], SOCKS5_VERSION);
        assert_eq!(response[3], SOCKS5_REPLY_OK);
        assert_eq!(&response[5..9], &[127, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_handshake_domain_target() {
        let (mut server_end, client_end) = duplex(512);

        let addr = [
            &[0x03u8, 11][..],
            b"example.com",
            &443u16.to_be_bytes(),
        ]
        .concat();
        let client = tokio::spawn(client_side(client_end, connect_request(&addr)));

        let target = handshake(&mut server_end, None).await.unwrap();
        assert_eq!(target, Address::Domain("example.com".to_string(), 443));
        drop(server_end);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_requires_no_auth_method() {
        let (mut server_end, client_end) = duplex(512);

        // client only offers username/password
        let client = tokio::spawn(client_side(client_end, vec![SOCKS5_VERSION, 1, 0x02]));

        let err = handshake(&mut server_end, None).await.unwrap_err();
        assert!(format!("{err}").contains("no supported methods"));
        drop(server_end);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_version() {
        let (mut server_end, client_end) = duplex(512);
        let client = tokio::spawn(client_side(client_end, vec![0x04, 1, 0x00]));

        let err = handshake(&mut server_end, None).await.unwrap_err();
        assert!(format!("{err}").contains("unknown method version"));
        drop(server_end);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_replies_to_unsupported_command() {
        let (mut server_end, client_end) = duplex(512);

        // BIND request
        let mut request = vec![SOCKS5_VERSION, 1, SOCKS5_METHOD_NO_AUTH];
        request.extend_from_slice(&[SOCKS5_VERSION, 0x02, SOCKS5_RESERVED]);
        let client = tokio::spawn(client_side(client_end, request));

        let err = handshake(&mut server_end, None).await.unwrap_err();
        assert!(matches!(
            err,
            SockchainError::Reply(ReplyError::CmdNotSupported)
        ));
        drop(server_end);

        let response = client.await.unwrap();
        assert_eq!(response[3], ReplyError::CmdNotSupported.code());
    }

    #[tokio::test]
    async fn test_server_listen_accept_close() {
        let server = Server::listen("tcp", "127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        assert!(!server.is_closed());

        let connect = tokio::spawn(tokio::net::TcpStream::connect(addr));
        let client = server.accept().await.unwrap();
        assert!(client.local.is_some());
        connect.await.unwrap().unwrap();

        server.close().unwrap();
        assert!(server.is_closed());
        assert!(server.accept().await.is_err());
        // closing twice reports an error
        assert!(server.close().is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_accept() {
        let server = std::sync::Arc::new(Server::listen("tcp", "127.0.0.1:0").await.unwrap());

        let accepting = {
            let server = server.clone();
            tokio::spawn(async move { server.accept().await.is_err() })
        };
        // give the accept a chance to start waiting
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        server.close().unwrap();
        assert!(accepting.await.unwrap());
    }

    #[tokio::test]
    async fn test_listen_rejects_unknown_network() {
        assert!(Server::listen("udp", "127.0.0.1:0").await.is_err());
    }
}
