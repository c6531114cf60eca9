//! 双向数据转发
//!
//! Two copy tasks, one per direction. EOF on one side propagates as a
//! write-shutdown (FIN) to the other, and once a direction finishes the
//! opposite one gets a short grace to drain before it is torn down — a
//! peer blocked on a half-closed connection never hangs the session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Grace given to the surviving direction after the first one finishes.
pub const HALF_CLOSE_GRACE: Duration = Duration::from_millis(500);

const COPY_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct RelayOptions {
    /// Idle bound per read; expiry ends the direction cleanly.
    pub read_timeout: Option<Duration>,
    /// Idle bound per write; expiry ends the direction cleanly.
    pub write_timeout: Option<Duration>,
}

/// Copy one direction until EOF, error, or idle expiry. Returns Ok on EOF
/// and on idle expiry; the byte count accumulates in `counter` so it
/// survives an abort of the sibling task.
async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    counter: Arc<AtomicU64>,
    opts: RelayOptions,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = match opts.read_timeout {
            Some(t) => match tokio::time::timeout(t, reader.read(&mut buf)).await {
                Ok(r) => r?,
                Err(_) => break, // idle, not an error
            },
            None => reader.read(&mut buf).await?,
        };
        if n == 0 {
            break;
        }

        let write = writer.write_all(&buf[..n]);
        match opts.write_timeout {
            Some(t) => match tokio::time::timeout(t, write).await {
                Ok(r) => r?,
                Err(_) => break,
            },
            None => write.await?,
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    // 半关闭传递
    let _ = writer.shutdown().await;
    Ok(())
}

/// Relay until both directions are done. Returns (a→b, b→a) byte counts;
/// the first non-deadline error from either direction wins.
pub async fn relay<A, B>(a: A, b: B, opts: RelayOptions) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);

    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let mut up = tokio::spawn(copy_direction(ar, bw, a_to_b.clone(), opts));
    let mut down = tokio::spawn(copy_direction(br, aw, b_to_a.clone(), opts));

    // Wait for the first direction; the other gets HALF_CLOSE_GRACE.
    let (first_res, rest) = tokio::select! {
        r = &mut up => (join_result(r), &mut down),
        r = &mut down => (join_result(r), &mut up),
    };

    let second_res = match tokio::time::timeout(HALF_CLOSE_GRACE, &mut *rest).await {
        Ok(r) => join_result(r),
        Err(_) => {
            // grace expired: tear the survivor down, absorb the expiry
            rest.abort();
            let _ = (&mut *rest).await;
            Ok(())
        }
    };

    let counts = (
        a_to_b.load(Ordering::Relaxed),
        b_to_a.load(Ordering::Relaxed),
    );
    debug!(
        up = counts.0,
        down = counts.1,
        "relay finished"
    );

    first_res.and(second_res).map(|_| counts)
}

fn join_result(
    r: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> std::io::Result<()> {
    match r {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(std::io::Error::other(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn relays_both_directions() {
        // client <-> (left | relay | right) <-> server
        let (mut client, left) = duplex(4096);
        let (right, mut server) = duplex(4096);

        let handle = tokio::spawn(relay(left, right, RelayOptions::default()));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        drop(server);
        let (up, down) = handle.await.unwrap().unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 5);
    }

    #[tokio::test]
    async fn half_close_unblocks_peer_within_grace() {
        let (mut client, left) = duplex(4096);
        let (right, server) = duplex(4096);

        let handle = tokio::spawn(relay(left, right, RelayOptions::default()));

        client.write_all(b"0123456789").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        // server never writes and never closes; the relay must still
        // finish within the half-close grace
        let start = Instant::now();
        let (up, _down) = handle.await.unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(up, 10);
        drop(server);
    }

    #[tokio::test]
    async fn eof_propagates_as_fin() {
        let (mut client, left) = duplex(4096);
        let (right, mut server) = duplex(4096);

        tokio::spawn(relay(left, right, RelayOptions::default()));

        client.write_all(b"done").await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"done");
    }

    #[tokio::test]
    async fn idle_read_timeout_ends_session_cleanly() {
        let (client, left) = duplex(4096);
        let (right, server) = duplex(4096);

        let opts = RelayOptions {
            read_timeout: Some(Duration::from_millis(50)),
            write_timeout: None,
        };
        let start = Instant::now();
        let res = relay(left, right, opts).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(res, (0, 0));
        drop(client);
        drop(server);
    }

    #[tokio::test]
    async fn counts_partial_transfer() {
        let (mut client, left) = duplex(4096);
        let (right, mut server) = duplex(4096);

        let handle = tokio::spawn(relay(left, right, RelayOptions::default()));

        for _ in 0..3 {
            client.write_all(&[0xAB; 100]).await.unwrap();
        }
        let mut sink = [0u8; 300];
        server.read_exact(&mut sink).await.unwrap();

        drop(client);
        drop(server);
        let (up, _) = handle.await.unwrap().unwrap();
        assert_eq!(up, 300);
    }
}
