//! Accept loop with temporary-error backoff and graceful-shutdown gating.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Per-connection session entry point. One task per accepted connection;
/// nothing a session does may block the acceptor.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()>;
}

/// how long to sleep on the next accept failure
pub fn delay_calc(delay: Duration) -> Duration {
    let next = if delay.is_zero() {
        Duration::from_millis(5)
    } else {
        delay * 2
    };
    next.min(Duration::from_secs(1))
}

/// ENFILE/EMFILE: fd exhaustion clears once sessions finish, so it only
/// deserves backoff, not a dead listener.
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

fn is_temporary(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    ) || matches!(e.raw_os_error(), Some(ENFILE) | Some(EMFILE))
}

/// Accept connections until a permanent error or shutdown. On shutdown the
/// loop lingers for `graceful_timeout` so in-flight sessions can drain.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn SessionHandler>,
    cancel: CancellationToken,
    graceful_timeout: Duration,
) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "listening");

    let mut delay = Duration::ZERO;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(addr = %local, timeout = ?graceful_timeout, "graceful shutdown");
                tokio::time::sleep(graceful_timeout).await;
                return Ok(());
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        delay = Duration::ZERO;
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle(stream, peer).await {
                                debug!(peer = %peer, error = %e, "session ended with error");
                            }
                        });
                    }
                    Err(e) if is_temporary(&e) => {
                        delay = delay_calc(delay);
                        error!(error = %e, retry_in = ?delay, "accept error, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut delay = Duration::ZERO;
        let mut observed = Vec::new();
        for _ in 0..10 {
            delay = delay_calc(delay);
            observed.push(delay.as_millis() as u64);
        }
        assert_eq!(
            observed,
            vec![5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]
        );
    }

    #[test]
    fn backoff_resets_from_zero() {
        assert_eq!(delay_calc(Duration::ZERO), Duration::from_millis(5));
    }

    #[test]
    fn temporary_error_classification() {
        assert!(is_temporary(&std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "x"
        )));
        assert!(is_temporary(&std::io::Error::from_raw_os_error(24)));
        assert!(!is_temporary(&std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "x"
        )));
    }

    struct CountingHandler(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl SessionHandler for CountingHandler {
        async fn handle(&self, _stream: TcpStream, _peer: SocketAddr) -> anyhow::Result<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn accepts_and_dispatches() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(CountingHandler(std::sync::atomic::AtomicUsize::new(0)));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(serve(
            listener,
            handler.clone(),
            cancel.clone(),
            Duration::from_millis(10),
        ));

        for _ in 0..3 {
            let _ = TcpStream::connect(addr).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.0.load(std::sync::atomic::Ordering::SeqCst), 3);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_graceful_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handler = Arc::new(CountingHandler(std::sync::atomic::AtomicUsize::new(0)));
        let cancel = CancellationToken::new();

        let started = std::time::Instant::now();
        let task = tokio::spawn(serve(
            listener,
            handler,
            cancel.clone(),
            Duration::from_millis(200),
        ));
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
