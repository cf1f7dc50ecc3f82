//! Bidirectional byte stream coupling.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes between `a` and `b` in both directions until either direction
/// reaches EOF or fails, then shut down and drop both streams.
///
/// The direction still running when the other one stops is cancelled, so the
/// call returns as soon as one side is done. The error of the direction that
/// stopped first, if any, is returned.
pub async fn bridge<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let result = tokio::select! {
        res = tokio::io::copy(&mut a_read, &mut b_write) => {
            debug!("Bridge a->b finished: {:?}", res);
            res
        }
        res = tokio::io::copy(&mut b_read, &mut a_write) => {
            debug!("Bridge b->a finished: {:?}", res);
            res
        }
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    result.map(|_| ())
}
