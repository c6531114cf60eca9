use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// 代理流类型别名：任何实现了 AsyncRead + AsyncWrite + Send + Unpin 的类型
pub type ProxyStream = Box<dyn AsyncStream>;

/// 异步流 trait，组合 AsyncRead + AsyncWrite
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {
    fn as_any(&self) -> &dyn Any;
}

/// 为所有满足约束的类型自动实现 AsyncStream
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 带前缀缓冲的流：先读取预读数据，然后读取底层流
pub struct PrefixedStream {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: ProxyStream,
}

impl PrefixedStream {
    pub fn new(prefix: Vec<u8>, inner: ProxyStream) -> Self {
        Self {
            prefix,
            prefix_pos: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = &self.prefix[self.prefix_pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.prefix_pos += to_copy;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Default cork buffer: one handshake's worth of bytes.
pub const CORK_BUF_SIZE: usize = 1280;
/// Default cork delay before buffered bytes go out on their own.
pub const CORK_DELAY: Duration = Duration::from_millis(10);

enum CorkState {
    /// Buffering writes until size/time threshold.
    Corked {
        buf: Vec<u8>,
        deadline: Pin<Box<Sleep>>,
    },
    /// Flushing the buffered bytes to the inner stream.
    Draining { buf: Vec<u8>, written: usize },
    /// Cork spent, plain passthrough from here on.
    Passthrough,
}

/// 写合并流：短暂缓冲最初的写入，将握手字节合并成单个段发出
///
/// Uncorked by buffer overflow, timer expiry, explicit flush, or any read
/// on the stream. The read trigger is the deadlock guard: once the session
/// waits for a response, everything buffered must already be on the wire.
pub struct CorkStream {
    inner: ProxyStream,
    cap: usize,
    state: CorkState,
}

impl CorkStream {
    pub fn new(inner: ProxyStream) -> Self {
        Self::with_params(inner, CORK_BUF_SIZE, CORK_DELAY)
    }

    pub fn with_params(inner: ProxyStream, buf_size: usize, delay: Duration) -> Self {
        Self {
            inner,
            cap: buf_size,
            state: CorkState::Corked {
                buf: Vec::with_capacity(buf_size),
                deadline: Box::pin(tokio::time::sleep(delay)),
            },
        }
    }

    /// Drive the state machine until every buffered byte is handed to the
    /// inner stream and the state is Passthrough.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        loop {
            match &mut self.state {
                CorkState::Corked { buf, .. } => {
                    let buf = std::mem::take(buf);
                    self.state = if buf.is_empty() {
                        CorkState::Passthrough
                    } else {
                        CorkState::Draining { buf, written: 0 }
                    };
                }
                CorkState::Draining { buf, written } => {
                    while *written < buf.len() {
                        match Pin::new(&mut self.inner).poll_write(cx, &buf[*written..]) {
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(std::io::Error::new(
                                    std::io::ErrorKind::WriteZero,
                                    "write returned 0",
                                )));
                            }
                            Poll::Ready(Ok(n)) => *written += n,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    self.state = CorkState::Passthrough;
                }
                CorkState::Passthrough => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncRead for CorkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CorkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                CorkState::Corked { buf, deadline } => {
                    let expired = deadline.as_mut().poll(cx).is_ready();
                    if expired || buf.len() + data.len() > this.cap {
                        match this.poll_drain(cx) {
                            Poll::Ready(Ok(())) => continue,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    buf.extend_from_slice(data);
                    return Poll::Ready(Ok(data.len()));
                }
                CorkState::Draining { .. } => match this.poll_drain(cx) {
                    Poll::Ready(Ok(())) => continue,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                },
                CorkState::Passthrough => return Pin::new(&mut this.inner).poll_write(cx, data),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn prefixed_stream_serves_prefix_first() {
        let (client, mut server) = duplex(64);
        let mut stream = PrefixedStream::new(b"abc".to_vec(), Box::new(client));

        server.write_all(b"def").await.unwrap();

        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"def");
    }

    #[tokio::test]
    async fn cork_coalesces_until_flush() {
        let (client, mut server) = duplex(4096);
        let mut stream = CorkStream::with_params(
            Box::new(client),
            CORK_BUF_SIZE,
            Duration::from_secs(60), // timer out of the picture
        );

        stream.write_all(b"salt").await.unwrap();
        stream.write_all(b"envelope").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 12];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"saltenvelope");

        // Spent after first flush: subsequent writes go straight through.
        stream.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        server.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"x");
    }

    #[tokio::test]
    async fn cork_uncorks_on_overflow() {
        let (client, mut server) = duplex(65536);
        let mut stream =
            CorkStream::with_params(Box::new(client), 8, Duration::from_secs(60));

        stream.write_all(b"0123").await.unwrap();
        // Exceeds the 8-byte cork: everything must hit the wire without a flush.
        stream.write_all(b"456789").await.unwrap();

        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0123456789");
    }

    #[tokio::test]
    async fn cork_flushes_before_read() {
        let (client, mut server) = duplex(4096);
        let mut stream = CorkStream::new(Box::new(client));

        stream.write_all(b"request").await.unwrap();

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 7];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"request");
            server.write_all(b"reply").await.unwrap();
        });

        // The read drives the buffered bytes out first.
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
        echo.await.unwrap();
    }
}
