//! Timeout-bounded outbound TCP dialing.
//!
//! Centralizes connect behavior so both roles fail the same way: a refused
//! or unreachable target surfaces as the underlying io::Error, a stalled
//! one as a connect timeout.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use super::addr::Address;
use super::error::{ProxyError, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Dialer {
    connect_timeout: Duration,
}

impl Default for Dialer {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Dialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        debug!(addr = %addr, "dialer connected");
        Ok(stream)
    }

    /// Connect to a proxy target, resolving domains through the OS resolver.
    pub async fn connect_addr(&self, addr: &Address) -> Result<TcpStream> {
        match addr {
            Address::Ip(sa) => self.connect(*sa).await,
            Address::Domain(domain, port) => {
                let host_port = format!("{}:{}", domain, port);
                let stream =
                    tokio::time::timeout(self.connect_timeout, TcpStream::connect(&host_port))
                        .await
                        .map_err(|_| ProxyError::Timeout)??;
                debug!(addr = %host_port, "dialer connected");
                Ok(stream)
            }
        }
    }
}
