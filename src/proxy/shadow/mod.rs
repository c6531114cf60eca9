//! AEAD stream transport.
//!
//! Wraps a byte-oriented duplex stream with the Shadowsocks AEAD record
//! protocol: a cleartext per-direction salt, an HKDF-derived subkey, and
//! length-prefixed sealed records. Reader and writer initialize
//! independently — the writer sends its salt with the first outgoing
//! record, the reader pulls the peer salt on the first incoming read — so
//! neither direction can deadlock waiting on the other.

pub mod crypto;
pub mod replay;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::error::ProxyError;
use crate::common::stream::ProxyStream;

use crypto::{AeadCipher, CipherSpec};
use replay::SaltFilter;

/// Maximum payload size per AEAD record (0x3FFF = 16383)
pub const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

/// Wrap a stream with the configured cipher. The DUMMY cipher is a
/// pass-through: the stream is returned untouched.
pub fn wrap(stream: ProxyStream, spec: &CipherSpec, filter: Arc<SaltFilter>) -> ProxyStream {
    if spec.kind().is_dummy() {
        stream
    } else {
        Box::new(AeadStream::new(stream, spec.clone(), filter))
    }
}

/// Read state machine for AEAD stream decryption.
enum ReadState {
    /// Peer salt not seen yet (decoder not initialized)
    Salt { salt_buf: Vec<u8>, salt_read: usize },
    /// Reading the sealed length frame (2 + tag_len bytes)
    Length { len_buf: Vec<u8>, len_read: usize },
    /// Reading the sealed payload frame (payload_len + tag_len bytes)
    Payload {
        payload_buf: Vec<u8>,
        payload_read: usize,
    },
}

/// Write state machine for AEAD stream encryption.
enum WriteState {
    /// Own salt not sent yet (encoder not initialized)
    Salt,
    /// Ready to accept new data
    Ready,
    /// Have sealed data pending write
    Writing {
        data: Vec<u8>,
        written: usize,
        original_len: usize,
    },
}

/// AEAD-framed duplex stream.
pub struct AeadStream<S> {
    inner: S,
    spec: CipherSpec,
    filter: Arc<SaltFilter>,
    encoder: Option<AeadCipher>,
    decoder: Option<AeadCipher>,
    /// Salt generated on writer init, prepended to the first record write.
    pending_salt: Option<Vec<u8>>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_state: ReadState,
    write_state: WriteState,
}

impl<S> AeadStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S, spec: CipherSpec, filter: Arc<SaltFilter>) -> Self {
        let salt_len = spec.kind().salt_len();
        Self {
            inner,
            spec,
            filter,
            encoder: None,
            decoder: None,
            pending_salt: None,
            read_buf: Vec::new(),
            read_pos: 0,
            read_state: ReadState::Salt {
                salt_buf: vec![0u8; salt_len],
                salt_read: 0,
            },
            write_state: WriteState::Salt,
        }
    }

    /// Give the underlying stream back, e.g. to drain raw bytes after a
    /// failed handshake.
    pub fn into_inner(self) -> S {
        self.inner
    }

    #[cfg(test)]
    fn encoder_nonce(&self) -> Option<[u8; crypto::NONCE_LEN]> {
        self.encoder.as_ref().map(|e| *e.nonce())
    }
}

impl<S> AsyncRead for AeadStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            // Serve leftover plaintext from the previous record first
            if this.read_pos < this.read_buf.len() {
                let remaining = &this.read_buf[this.read_pos..];
                let to_copy = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..to_copy]);
                this.read_pos += to_copy;
                if this.read_pos >= this.read_buf.len() {
                    this.read_buf.clear();
                    this.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match &mut this.read_state {
                ReadState::Salt {
                    salt_buf,
                    salt_read,
                } => {
                    while *salt_read < salt_buf.len() {
                        let mut rb = ReadBuf::new(&mut salt_buf[*salt_read..]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                            Poll::Ready(Ok(())) => {
                                let n = rb.filled().len();
                                if n == 0 {
                                    if *salt_read == 0 {
                                        // clean close before any handshake byte
                                        return Poll::Ready(Ok(()));
                                    }
                                    return Poll::Ready(Err(ProxyError::ShortRead.into()));
                                }
                                *salt_read += n;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    // 盐重放检查，再初始化解密器
                    if this.filter.check(salt_buf) {
                        return Poll::Ready(Err(ProxyError::RepeatedSalt.into()));
                    }
                    this.filter.add(salt_buf);

                    let decoder = this
                        .spec
                        .session_cipher(salt_buf)
                        .map_err(std::io::Error::from)?;
                    this.decoder = Some(decoder);

                    let tag_len = this.spec.kind().tag_len();
                    this.read_state = ReadState::Length {
                        len_buf: vec![0u8; 2 + tag_len],
                        len_read: 0,
                    };
                }

                ReadState::Length { len_buf, len_read } => {
                    while *len_read < len_buf.len() {
                        let mut rb = ReadBuf::new(&mut len_buf[*len_read..]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                            Poll::Ready(Ok(())) => {
                                let n = rb.filled().len();
                                if n == 0 {
                                    if *len_read == 0 {
                                        // EOF between records is a clean close
                                        return Poll::Ready(Ok(()));
                                    }
                                    return Poll::Ready(Err(std::io::Error::new(
                                        std::io::ErrorKind::UnexpectedEof,
                                        "connection closed inside length frame",
                                    )));
                                }
                                *len_read += n;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    let decoder = this
                        .decoder
                        .as_mut()
                        .ok_or_else(|| std::io::Error::other("decoder not initialized"))?;
                    let len_plain = decoder.open(len_buf).map_err(std::io::Error::from)?;

                    let payload_len =
                        (u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize)
                            & MAX_PAYLOAD_SIZE;

                    let tag_len = this.spec.kind().tag_len();
                    this.read_state = ReadState::Payload {
                        payload_buf: vec![0u8; payload_len + tag_len],
                        payload_read: 0,
                    };
                }

                ReadState::Payload {
                    payload_buf,
                    payload_read,
                } => {
                    while *payload_read < payload_buf.len() {
                        let mut rb = ReadBuf::new(&mut payload_buf[*payload_read..]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                            Poll::Ready(Ok(())) => {
                                let n = rb.filled().len();
                                if n == 0 {
                                    return Poll::Ready(Err(std::io::Error::new(
                                        std::io::ErrorKind::UnexpectedEof,
                                        "connection closed inside payload frame",
                                    )));
                                }
                                *payload_read += n;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    let decoder = this
                        .decoder
                        .as_mut()
                        .ok_or_else(|| std::io::Error::other("decoder not initialized"))?;
                    let payload = decoder.open(payload_buf).map_err(std::io::Error::from)?;

                    this.read_buf = payload;
                    this.read_pos = 0;

                    let tag_len = this.spec.kind().tag_len();
                    this.read_state = ReadState::Length {
                        len_buf: vec![0u8; 2 + tag_len],
                        len_read: 0,
                    };
                    // loop back to serve the decrypted bytes
                }
            }
        }
    }
}

impl<S> AeadStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Drive any pending sealed bytes into the inner stream.
    fn poll_write_pending(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<usize>> {
        loop {
            match &mut self.write_state {
                WriteState::Writing {
                    data,
                    written,
                    original_len,
                } => {
                    while *written < data.len() {
                        match Pin::new(&mut self.inner).poll_write(cx, &data[*written..]) {
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
                    let n = *original_len;
                    self.write_state = WriteState::Ready;
                    return Poll::Ready(Ok(n));
                }
                _ => return Poll::Ready(Ok(0)),
            }
        }
    }
}

impl<S> AsyncWrite for AeadStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match &mut this.write_state {
                WriteState::Salt => {
                    // Writer-side lazy init: fresh salt, recorded in the
                    // filter, sent in the clear ahead of the first record.
                    let salt_len = this.spec.kind().salt_len();
                    let mut salt = vec![0u8; salt_len];
                    rand::thread_rng().fill(&mut salt[..]);

                    let encoder = this
                        .spec
                        .session_cipher(&salt)
                        .map_err(std::io::Error::from)?;
                    this.filter.add(&salt);
                    this.encoder = Some(encoder);
                    this.pending_salt = Some(salt);
                    this.write_state = WriteState::Ready;
                }

                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }

                    let chunk_len = buf.len().min(MAX_PAYLOAD_SIZE);
                    let chunk = &buf[..chunk_len];

                    let encoder = this
                        .encoder
                        .as_mut()
                        .ok_or_else(|| std::io::Error::other("encoder not initialized"))?;
                    let sealed_len = encoder
                        .seal(&(chunk_len as u16).to_be_bytes())
                        .map_err(std::io::Error::from)?;
                    let sealed_payload = encoder.seal(chunk).map_err(std::io::Error::from)?;

                    // salt (first record only) + length + payload in one write
                    let salt = this.pending_salt.take().unwrap_or_default();
                    let mut data =
                        Vec::with_capacity(salt.len() + sealed_len.len() + sealed_payload.len());
                    data.extend_from_slice(&salt);
                    data.extend_from_slice(&sealed_len);
                    data.extend_from_slice(&sealed_payload);

                    this.write_state = WriteState::Writing {
                        data,
                        written: 0,
                        original_len: chunk_len,
                    };
                }

                WriteState::Writing { .. } => {
                    return this.poll_write_pending(cx);
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.poll_write_pending(cx) {
            Poll::Ready(Ok(_)) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.poll_write_pending(cx) {
            Poll::Ready(Ok(_)) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::{evp_bytes_to_key, CipherKind};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn spec_aes128() -> CipherSpec {
        CipherSpec::from_psk(CipherKind::Aes128Gcm, evp_bytes_to_key(b"pw", 16)).unwrap()
    }

    #[tokio::test]
    async fn single_record_wire_layout() {
        // salt(16) + sealed(BE16 len) + sealed("Hello")
        let (a, mut b) = duplex(4096);
        let mut w = AeadStream::new(a, spec_aes128(), Arc::new(SaltFilter::new()));
        w.write_all(b"Hello").await.unwrap();

        let mut wire = vec![0u8; 16 + (2 + 16) + (5 + 16)];
        b.read_exact(&mut wire).await.unwrap();

        // nothing beyond the one record
        let mut probe = [0u8; 1];
        let extra =
            tokio::time::timeout(std::time::Duration::from_millis(50), b.read(&mut probe)).await;
        assert!(extra.is_err(), "unexpected trailing bytes");

        // a reader with the same psk and a fresh filter recovers the payload
        let mut r = AeadStream::new(
            std::io::Cursor::new(wire),
            spec_aes128(),
            Arc::new(SaltFilter::new()),
        );
        let mut out = [0u8; 5];
        r.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"Hello");
    }

    #[tokio::test]
    async fn replayed_stream_is_rejected() {
        let (a, mut b) = duplex(4096);
        let mut w = AeadStream::new(a, spec_aes128(), Arc::new(SaltFilter::new()));
        w.write_all(b"Hello").await.unwrap();

        let mut wire = vec![0u8; 16 + 18 + 21];
        b.read_exact(&mut wire).await.unwrap();

        let reader_filter = Arc::new(SaltFilter::new());
        let mut r1 = AeadStream::new(
            std::io::Cursor::new(wire.clone()),
            spec_aes128(),
            reader_filter.clone(),
        );
        let mut out = [0u8; 5];
        r1.read_exact(&mut out).await.unwrap();

        // identical bytes against the same filter: no plaintext, RepeatedSalt
        let mut r2 = AeadStream::new(std::io::Cursor::new(wire), spec_aes128(), reader_filter);
        let err = r2.read_exact(&mut out).await.unwrap_err();
        assert!(ProxyError::is_repeated_salt(&err));
    }

    #[tokio::test]
    async fn roundtrip_one_megabyte() {
        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i * 31 % 251) as u8).collect();
        let (a, b) = duplex(64 * 1024);

        let filter_w = Arc::new(SaltFilter::new());
        let filter_r = Arc::new(SaltFilter::new());
        let spec = spec_aes128();

        let mut w = AeadStream::new(a, spec.clone(), filter_w);
        let mut r = AeadStream::new(b, spec, filter_r);

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            w.write_all(&payload).await.unwrap();
            w.shutdown().await.unwrap();
        });

        let mut out = Vec::with_capacity(expected.len());
        r.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn nonce_advances_twice_per_record() {
        let (a, _b) = duplex(1024 * 1024);
        let mut w = AeadStream::new(a, spec_aes128(), Arc::new(SaltFilter::new()));

        assert!(w.encoder_nonce().is_none());
        for i in 1..=5u8 {
            w.write_all(b"record").await.unwrap();
            let nonce = w.encoder_nonce().unwrap();
            assert_eq!(nonce[0], 2 * i);
            assert!(nonce[1..].iter().all(|&b| b == 0));
        }
    }

    #[tokio::test]
    async fn large_write_chunks_at_payload_mask() {
        let (a, mut b) = duplex(1024 * 1024);
        let mut w = AeadStream::new(a, spec_aes128(), Arc::new(SaltFilter::new()));

        let payload = vec![0xA5u8; MAX_PAYLOAD_SIZE + 1];
        w.write_all(&payload).await.unwrap();

        // two records: full-size and a single trailing byte
        let expect =
            16 + (2 + 16) + (MAX_PAYLOAD_SIZE + 16) + (2 + 16) + (1 + 16);
        let mut wire = vec![0u8; expect];
        b.read_exact(&mut wire).await.unwrap();
        assert_eq!(w.encoder_nonce().unwrap()[0], 4);
    }

    #[tokio::test]
    async fn leftover_served_across_small_reads() {
        let (a, b) = duplex(4096);
        let mut w = AeadStream::new(a, spec_aes128(), Arc::new(SaltFilter::new()));
        let mut r = AeadStream::new(b, spec_aes128(), Arc::new(SaltFilter::new()));

        w.write_all(b"abcdefgh").await.unwrap();

        let mut out = Vec::new();
        let mut small = [0u8; 3];
        for _ in 0..2 {
            let n = r.read(&mut small).await.unwrap();
            out.extend_from_slice(&small[..n]);
        }
        let mut rest = [0u8; 2];
        r.read_exact(&mut rest).await.unwrap();
        out.extend_from_slice(&rest);
        assert_eq!(&out, b"abcdefgh");
    }

    #[tokio::test]
    async fn truncated_salt_is_short_read() {
        let mut r = AeadStream::new(
            std::io::Cursor::new(vec![0u8; 7]), // less than a salt
            spec_aes128(),
            Arc::new(SaltFilter::new()),
        );
        let mut out = [0u8; 1];
        let err = r.read_exact(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn eof_before_salt_is_clean_close() {
        let mut r = AeadStream::new(
            std::io::Cursor::new(Vec::new()),
            spec_aes128(),
            Arc::new(SaltFilter::new()),
        );
        let mut out = Vec::new();
        let n = r.read_to_end(&mut out).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn tampered_record_fails_open() {
        let (a, mut b) = duplex(4096);
        let mut w = AeadStream::new(a, spec_aes128(), Arc::new(SaltFilter::new()));
        w.write_all(b"Hello").await.unwrap();

        let mut wire = vec![0u8; 16 + 18 + 21];
        b.read_exact(&mut wire).await.unwrap();
        wire[20] ^= 0x80; // inside the sealed length frame

        let mut r = AeadStream::new(
            std::io::Cursor::new(wire),
            spec_aes128(),
            Arc::new(SaltFilter::new()),
        );
        let mut out = [0u8; 5];
        let err = r.read_exact(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn dummy_cipher_wrap_is_passthrough() {
        let spec = CipherSpec::from_config("DUMMY", "", "").unwrap();
        let (a, mut b) = duplex(256);
        let mut wrapped = wrap(Box::new(a), &spec, Arc::new(SaltFilter::new()));
        wrapped.write_all(b"plaintext").await.unwrap();
        let mut out = [0u8; 9];
        b.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"plaintext");
    }
}
