use thiserror::Error;

/// Crate-wide protocol error taxonomy. Session handling matches on these;
/// nothing in the proxy path is propagated by panic.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid SOCKS version: 0x{0:02x}")]
    BadVersion(u8),

    #[error("bad request")]
    BadRequest,

    #[error("command not supported: 0x{0:02x}")]
    CommandNotSupported(u8),

    #[error("authentication failed")]
    AuthFailed,

    #[error("bad address")]
    BadAddress,

    #[error("cipher not supported: {0}")]
    CipherNotSupported(String),

    #[error("key size error: need {0} bytes")]
    KeySize(usize),

    #[error("repeated salt detected")]
    RepeatedSalt,

    #[error("short read")]
    ShortRead,

    #[error("idle timeout")]
    Timeout,

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<ProxyError> for std::io::Error {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Io(io) => io,
            ProxyError::ShortRead => std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e),
            other => std::io::Error::other(other),
        }
    }
}

impl ProxyError {
    /// Recover the protocol error carried inside an io::Error produced by
    /// the AEAD stream's poll implementations.
    pub fn from_io_ref(e: &std::io::Error) -> Option<&ProxyError> {
        e.get_ref().and_then(|inner| inner.downcast_ref::<ProxyError>())
    }

    pub fn is_repeated_salt(e: &std::io::Error) -> bool {
        matches!(Self::from_io_ref(e), Some(ProxyError::RepeatedSalt))
    }
}
