//! Duplex byte bridge between the client and the tunneled connection
//!
//! Copies bytes in both directions concurrently. The first direction
//! to finish (EOF or error) tears the bridge down; the other copy is
//! abandoned and both streams are closed when the bridge returns.

use crate::error::Result;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Join two streams, relaying bytes both ways until one side finishes.
///
/// Returns `Ok(())` on a clean EOF in either direction, or when the
/// failure is the usual symptom of the peer's close racing ours.
/// Otherwise the first direction's error is returned.
pub async fn bridge<A, B>(a: A, b: B) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let res = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        res
    };
    let b_to_a = async {
        let res = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        res
    };

    let first = tokio::select! {
        res = a_to_b => res,
        res = b_to_a => res,
    };

    match first {
        Ok(bytes) => {
            debug!("bridge finished after {} bytes", bytes);
            Ok(())
        }
        Err(e) if is_closed_race(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether an IO error is the expected fallout of the peer half of
/// the bridge closing first.
fn is_closed_race(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
    )
}
