//! Test utilities for sockchain integration tests
//!
//! In-process upstream proxies and targets the chain tests dial
//! through.

use sockchain::addr::Address;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Counts connections accepted by a stub server.
pub type AcceptCounter = Arc<AtomicUsize>;

/// Spawn a minimal no-auth SOCKS5 proxy that really connects to the
/// requested target and relays bytes. Returns its address and an
/// accept counter.
pub async fn spawn_socks5_proxy() -> (SocketAddr, AcceptCounter) {
    spawn_socks5_proxy_with_delay(Duration::ZERO).await
}

/// Like [`spawn_socks5_proxy`], but stalls for `delay` before touching
/// the handshake. Used to trip dial deadlines.
pub async fn spawn_socks5_proxy_with_delay(delay: Duration) -> (SocketAddr, AcceptCounter) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts: AcceptCounter = Arc::new(AtomicUsize::new(0));

    let counter = accepts.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = serve_connect(&mut conn).await;
            });
        }
    });

    (addr, accepts)
}

/// Spawn a SOCKS5 proxy that answers every CONNECT with
/// "connection refused".
pub async fn spawn_refusing_proxy() -> (SocketAddr, AcceptCounter) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts: AcceptCounter = Arc::new(AtomicUsize::new(0));

    let counter = accepts.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if read_request(&mut conn).await.is_ok() {
                    // reply: connection refused, bound 0.0.0.0:0
                    let _ = conn
                        .write_all(&[5, 0x05, 0, 1, 0, 0, 0, 0, 0, 0])
                        .await;
                }
            });
        }
    });

    (addr, accepts)
}

/// Spawn a TCP echo server.
pub async fn spawn_echo_server() -> (SocketAddr, AcceptCounter) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts: AcceptCounter = Arc::new(AtomicUsize::new(0));

    let counter = accepts.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut reader, mut writer) = conn.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    (addr, accepts)
}

/// Serve one no-auth CONNECT request for real: connect onward to the
/// target and relay both directions.
async fn serve_connect(conn: &mut TcpStream) -> std::io::Result<()> {
    let target = read_request(conn).await?;

    let mut upstream = TcpStream::connect(target.to_string()).await?;
    conn.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;

    tokio::io::copy_bidirectional(conn, &mut upstream).await?;
    Ok(())
}

/// Read the method negotiation and CONNECT request, answering the
/// negotiation with no-auth.
async fn read_request(conn: &mut TcpStream) -> std::io::Result<Address> {
    let mut head = [0u8; 2];
    conn.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    conn.read_exact(&mut methods).await?;
    conn.write_all(&[5, 0]).await?;

    let mut request = [0u8; 3];
    conn.read_exact(&mut request).await?;
    Address::read_socks5(conn)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}
