//! Byte forwarding between async streams.
//!
//! A forwarding pair is two unidirectional [`pump`] loops, one per
//! direction, each on its own task. When either direction ends the pair is
//! cancelled and both write halves are shut down.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Buffer size for a single forwarding read.
pub const FORWARD_BUFFER_SIZE: usize = 4096;

/// Bytes moved by a forwarding pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Bytes copied from the first stream to the second.
    pub a_to_b: u64,
    /// Bytes copied from the second stream to the first.
    pub b_to_a: u64,
}

impl ForwardStats {
    /// Total bytes in both directions.
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Copies `reader` into `writer` until EOF or cancellation.
///
/// Every read is raced against `cancel`, so a stop request is observed even
/// while the reader is idle. Returns the number of bytes copied.
pub async fn pump<R, W>(reader: &mut R, writer: &mut W, cancel: &CancellationToken) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; FORWARD_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read(&mut buffer) => result?,
        };

        if n == 0 {
            break;
        }

        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        copied += n as u64;
    }

    Ok(copied)
}

/// Forwards bytes between `a` and `b` in both directions.
///
/// Runs until either side reaches EOF or fails, or until `cancel` fires.
pub async fn bridge<A, B>(a: A, b: B, cancel: CancellationToken) -> ForwardStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    splice(a_read, a_write, b, cancel).await
}

/// Forwards `input` into `stream` and `stream` into `output`.
///
/// This is [`bridge`] for a peer whose two directions are separate
/// handles, such as a terminal's stdin and stdout.
pub async fn splice<R, W, S>(
    mut input: R,
    mut output: W,
    stream: S,
    cancel: CancellationToken,
) -> ForwardStats
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);
    let pair = cancel.child_token();

    let upstream = {
        let pair = pair.clone();
        tokio::spawn(async move {
            let result = pump(&mut input, &mut stream_write, &pair).await;
            pair.cancel();
            let _ = stream_write.shutdown().await;
            result
        })
    };

    let downstream = {
        let pair = pair.clone();
        tokio::spawn(async move {
            let result = pump(&mut stream_read, &mut output, &pair).await;
            pair.cancel();
            let _ = output.shutdown().await;
            result
        })
    };

    let (upstream, downstream) = tokio::join!(upstream, downstream);

    ForwardStats {
        a_to_b: settle(upstream, "a->b"),
        b_to_a: settle(downstream, "b->a"),
    }
}

fn settle(result: Result<io::Result<u64>, tokio::task::JoinError>, direction: &str) -> u64 {
    match result {
        Ok(Ok(copied)) => copied,
        Ok(Err(e)) => {
            tracing::debug!(direction, error = %e, "Forwarding direction ended with error");
            0
        }
        Err(e) => {
            tracing::warn!(direction, error = %e, "Forwarding task failed");
            0
        }
    }
}
