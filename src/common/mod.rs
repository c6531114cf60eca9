pub mod addr;
pub mod dialer;
pub mod error;
pub mod stream;

pub use addr::Address;
pub use dialer::Dialer;
pub use error::{ProxyError, Result};
pub use stream::{CorkStream, PrefixedStream, ProxyStream};
