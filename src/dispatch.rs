//! Accept loop and per-client dispatch
//!
//! Each accepted client is served on its own task: run the inbound
//! handshake, pick a chain, dial the target through it (retrying with
//! freshly picked chains on failure), then bridge the two sockets.

use crate::bridge::bridge;
use crate::error::{Result, SockchainError};
use crate::picker::ChainPicker;
use crate::server::{handshake, ClientConn, Server};
use crate::stream::BoxedStream;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Serve inbound clients until the server is closed.
pub async fn serve(server: Arc<Server>, picker: Arc<dyn ChainPicker>, retry: u32) {
    loop {
        let client = match server.accept().await {
            Ok(client) => client,
            Err(e) => {
                if server.is_closed() {
                    break;
                }
                warn!("server: {}", e);
                continue;
            }
        };

        let picker = Arc::clone(&picker);
        tokio::spawn(handle_client(client, picker, retry));
    }
}

/// Handshake, dial, and bridge one client connection.
async fn handle_client(mut client: ClientConn, picker: Arc<dyn ChainPicker>, retry: u32) {
    let target = match handshake(&mut client.stream, client.local).await {
        Ok(target) => target,
        Err(e) => {
            warn!("server: {}", e);
            return;
        }
    };

    let (tunnel, chain) =
        match dial_with_retry(picker.as_ref(), retry, "tcp", &target.to_string()).await {
            Ok(result) => result,
            Err(e) => {
                warn!("dial {}: {}", target, e);
                return;
            }
        };

    info!("connection from {} to {} ({})", client.peer, target, chain);

    if let Err(e) = bridge(client.stream, tunnel).await {
        debug!("bridge {}: {}", target, e);
    }
}

/// Dial `address` through up to `retry + 1` picked chains.
///
/// Each attempt picks a chain, compiles it, and bounds the whole dial
/// by the first hop's `ChainConnTimeout` when present. Dial failures
/// move on to the next attempt; a chain that cannot even be compiled
/// aborts immediately. Returns the tunnel and a description of the
/// chain that produced it.
pub async fn dial_with_retry(
    picker: &dyn ChainPicker,
    retry: u32,
    network: &str,
    address: &str,
) -> Result<(BoxedStream, String)> {
    let mut last_err = None;

    for _ in 0..=retry {
        let chain = picker
            .next()
            .ok_or_else(|| SockchainError::Server("no loaded proxies".to_string()))?;
        let dialer = chain.to_dialer()?;
        let chain_timeout = dialer.chain_timeout()?;
        let description = dialer.to_string();

        let attempt = match chain_timeout {
            Some(limit) => match tokio::time::timeout(limit, dialer.dial(network, address)).await {
                Ok(result) => result,
                Err(_) => Err(SockchainError::Timeout("chain connect".to_string())),
            },
            None => dialer.dial(network, address).await,
        };

        match attempt {
            Ok(tunnel) => return Ok((tunnel, description)),
            Err(e) => {
                warn!("dial via {}: {}", description, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| SockchainError::Server("no dial attempts".to_string())))
}
