use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 8 * 1024;

/// Read `reader` to EOF, keeping at most `limit` bytes.
///
/// Reading continues past the limit so the writer never stalls on a full pipe.
/// Returns early with what was kept once `stop` is cancelled or a read fails.
pub(crate) async fn capture<R>(mut reader: R, limit: usize, stop: CancellationToken) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::with_capacity(limit.min(CHUNK_SIZE));
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = reader.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Output read failed, keeping captured bytes");
                break;
            }
        }
    }

    if total > kept.len() as u64 {
        tracing::debug!(kept = kept.len(), total, "Output truncated at limit");
    }
    kept
}
