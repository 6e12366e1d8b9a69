//! Bidirectional byte bridge between a gateway session and the local service

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub remote_to_local: u64,
    pub local_to_remote: u64,
}

/// Copy bytes between `remote` and `local` until both directions finish
///
/// EOF on one side half-closes the other and the opposite direction keeps
/// running. The first I/O error aborts both directions; both streams are
/// dropped on return either way.
pub async fn bridge<A, B>(remote: A, local: B) -> io::Result<BridgeStats>
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (remote_read, remote_write) = tokio::io::split(remote);
    let (local_read, local_write) = tokio::io::split(local);

    let (remote_to_local, local_to_remote) = tokio::try_join!(
        pipe(remote_read, local_write, "remote->local"),
        pipe(local_read, remote_write, "local->remote"),
    )?;

    Ok(BridgeStats {
        remote_to_local,
        local_to_remote,
    })
}

async fn pipe<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    direction: &'static str,
) -> io::Result<u64>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        total += n as u64;
    }

    trace!(direction, bytes = total, "Half closed");
    // Peer may already be gone
    let _ = writer.shutdown().await;

    Ok(total)
}
