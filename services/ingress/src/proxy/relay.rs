//! Bidirectional relay between a client and its backend.
//!
//! The sniffed ClientHello bytes are replayed to the backend first, then
//! two independent copy loops run until both have finished. Each loop, when
//! its reader hits EOF or an error, half-closes the peer it was writing to;
//! the other loop keeps draining until its own end.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Buffer size for each copy direction.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by one relay session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes written to the backend, replayed bytes included.
    pub to_backend: u64,
    /// Bytes written to the client.
    pub from_backend: u64,
}

/// Relay direction, used for logging.
#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToBackend,
    BackendToClient,
}

/// Relay `client` and `backend` until both directions have finished.
///
/// `replay` is written to the backend, in full, before any further client
/// byte. An error here is returned; errors inside the copy loops only end
/// their own direction and are logged.
pub async fn relay<C, B>(
    client: C,
    mut backend: B,
    replay: &[u8],
    idle_timeout: Option<Duration>,
) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    backend.write_all(replay).await?;
    backend.flush().await?;

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let (to_backend, from_backend) = tokio::join!(
        copy_half(
            &mut client_read,
            &mut backend_write,
            idle_timeout,
            Direction::ClientToBackend
        ),
        copy_half(
            &mut backend_read,
            &mut client_write,
            idle_timeout,
            Direction::BackendToClient
        ),
    );

    // Both halves of both streams drop here, closing the connections.
    Ok(RelayStats {
        to_backend: replay.len() as u64 + to_backend,
        from_backend,
    })
}

/// Copy until EOF or error, then half-close `writer`.
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
    direction: Direction,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    let outcome = loop {
        let read_result = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => reader.read(&mut buf).await,
        };

        match read_result {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = &outcome {
        debug!(direction = ?direction, bytes = total, error = %e, "Relay direction failed");
    }

    if let Err(e) = writer.shutdown().await {
        debug!(direction = ?direction, error = %e, "Half-close failed");
    }

    total
}
