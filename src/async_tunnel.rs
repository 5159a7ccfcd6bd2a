use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::observability;

const BUFFER_SIZE: usize = 65536; // 64KB

/// Any duplex byte stream a session can hold: plain TCP, TLS, in-memory.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Copies bytes both ways until either side finishes, then shuts down and
/// drops both ends. Returns `(client -> target, target -> client)` byte counts.
pub async fn pump<A, B>(client: A, target: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let mut upstream = 0u64;
    let mut downstream = 0u64;

    let client_to_target = copy_half(&mut client_read, &mut target_write, &mut upstream);
    let target_to_client = copy_half(&mut target_read, &mut client_write, &mut downstream);

    tokio::select! {
        _ = client_to_target => {},
        _ = target_to_client => {},
    }

    let _ = target_write.shutdown().await;
    let _ = client_write.shutdown().await;

    observability::record_pumped_bytes(upstream, downstream);
    (upstream, downstream)
}

pub(crate) async fn copy_half<R, W>(reader: &mut R, writer: &mut W, counter: &mut u64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                // flush so TLS writers emit the record now
                if writer.write_all(&buf[..n]).await.is_err() || writer.flush().await.is_err() {
                    break;
                }
                *counter += n as u64;
            }
            Err(_) => break,
        }
    }
}
