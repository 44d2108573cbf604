//! Chain dialer
//!
//! Opens a transport connection to the first hop, then walks the
//! chain left to right, running each hop's client protocol with the
//! next hop's address as the CONNECT target. The last hop connects to
//! the caller's destination, and its `ReadTimeout`/`WriteTimeout`
//! options become absolute deadlines on the finished tunnel.

use crate::config::{
    parse_duration, KWARG_CHAIN_CONN_TIMEOUT, KWARG_CONN_TIMEOUT, KWARG_READ_TIMEOUT,
    KWARG_WRITE_TIMEOUT,
};
use crate::error::{Result, SockchainError};
use crate::proxy::HopDialer;
use crate::stream::{self, BoxedStream, DeadlineStream};
use std::fmt;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Dials a destination through an ordered sequence of hops
#[derive(Debug)]
pub struct ChainDialer {
    hops: Vec<HopDialer>,
}

impl ChainDialer {
    /// Assemble a dialer from compiled hops.
    pub fn new(hops: Vec<HopDialer>) -> Self {
        ChainDialer { hops }
    }

    /// The hops in traversal order.
    pub fn hops(&self) -> &[HopDialer] {
        &self.hops
    }

    /// The whole-chain dial deadline, read from the first hop's
    /// `ChainConnTimeout` option.
    pub fn chain_timeout(&self) -> Result<Option<Duration>> {
        let Some(first) = self.hops.first() else {
            return Ok(None);
        };
        match first.kwargs().get(KWARG_CHAIN_CONN_TIMEOUT) {
            Some(value) => Ok(Some(parse_duration(value)?)),
            None => Ok(None),
        }
    }

    /// Dial `address` on `network` through every hop, returning the
    /// end-to-end tunnel.
    ///
    /// Exactly one outbound transport connection is opened, to the
    /// first hop; every further hop is reached through the CONNECT of
    /// the hop before it. Any failure closes the live connection and
    /// reports the failing hop.
    pub async fn dial(&self, network: &str, address: &str) -> Result<BoxedStream> {
        let first = self
            .hops
            .first()
            .ok_or_else(|| SockchainError::Config("no dialers".to_string()))?;

        // the entry connect and the first hop's handshake share one
        // ConnTimeout window
        let entry_deadline = hop_deadline(first).map_err(|e| wrap(first, e))?;
        let mut conn = run_scoped(
            entry_deadline,
            stream::connect(first.network(), first.address()),
        )
        .await
        .map_err(|e| wrap(first, e))?;

        for (i, hop) in self.hops.iter().enumerate() {
            let (next_network, next_address) = match self.hops.get(i + 1) {
                Some(next) => (next.network(), next.address()),
                None => (network, address),
            };

            let deadline = if i == 0 {
                entry_deadline
            } else {
                hop_deadline(hop).map_err(|e| wrap(hop, e))?
            };

            conn = run_scoped(deadline, hop.dial_over(conn, next_network, next_address))
                .await
                .map_err(|e| wrap(hop, e))?;
        }

        let last = self.hops.last().expect("chain has at least one hop");
        self.apply_tunnel_deadlines(last, conn).map_err(|e| wrap(last, e))
    }

    /// Apply the last hop's `ReadTimeout`/`WriteTimeout` options as
    /// absolute deadlines on the finished tunnel.
    fn apply_tunnel_deadlines(&self, last: &HopDialer, conn: BoxedStream) -> Result<BoxedStream> {
        let read_timeout = match last.kwargs().get(KWARG_READ_TIMEOUT) {
            Some(value) => Some(parse_duration(value)?),
            None => None,
        };
        let write_timeout = match last.kwargs().get(KWARG_WRITE_TIMEOUT) {
            Some(value) => Some(parse_duration(value)?),
            None => None,
        };

        if read_timeout.is_none() && write_timeout.is_none() {
            return Ok(conn);
        }

        let mut deadlined = DeadlineStream::new(conn);
        if let Some(timeout) = read_timeout {
            deadlined.set_read_timeout(timeout);
        }
        if let Some(timeout) = write_timeout {
            deadlined.set_write_timeout(timeout);
        }
        Ok(Box::new(deadlined))
    }
}

impl fmt::Display for ChainDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, hop) in self.hops.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{} {}", hop.protocol(), hop.address())?;
        }
        Ok(())
    }
}

/// A hop's `ConnTimeout` option as an absolute deadline from now.
fn hop_deadline(hop: &HopDialer) -> Result<Option<Instant>> {
    match hop.kwargs().get(KWARG_CONN_TIMEOUT) {
        Some(value) => Ok(Some(Instant::now() + parse_duration(value)?)),
        None => Ok(None),
    }
}

/// Run a dial step under an optional deadline. On expiry the step's
/// future is dropped, which closes the connection it owns.
async fn run_scoped<F, T>(deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match deadline {
        Some(at) => match timeout_at(at, fut).await {
            Ok(result) => result,
            Err(_) => Err(SockchainError::Timeout("handshake".to_string())),
        },
        None => fut.await,
    }
}

fn wrap(hop: &HopDialer, err: SockchainError) -> SockchainError {
    err.at_hop(hop.protocol(), hop.address())
}
