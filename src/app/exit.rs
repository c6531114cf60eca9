//! Exit (server-side) session orchestrator.
//!
//! Terminates the encrypted transport, authenticates the tunnel
//! credentials, dials the true destination and relays. Handshake
//! failures — replayed salts, garbage that fails the AEAD, unknown
//! accounts — are never answered: the connection is drained silently so
//! an active prober learns nothing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::common::addr::Address;
use crate::common::dialer::Dialer;
use crate::common::error::ProxyError;
use crate::common::stream::ProxyStream;
use crate::config::accounts::Account;
use crate::config::types::Config;
use crate::proxy::envelope;
use crate::proxy::relay::{relay, RelayOptions};
use crate::proxy::shadow::crypto::CipherSpec;
use crate::proxy::shadow::replay::SaltFilter;
use crate::proxy::shadow::AeadStream;

use super::listener::SessionHandler;

pub struct ExitHandler {
    spec: CipherSpec,
    filter: Arc<SaltFilter>,
    accounts: Arc<dyn Account>,
    relay_opts: RelayOptions,
    drain_timeout: Duration,
    dialer: Dialer,
}

impl ExitHandler {
    pub fn new(
        config: &Config,
        filter: Arc<SaltFilter>,
        accounts: Arc<dyn Account>,
    ) -> anyhow::Result<Self> {
        let spec = CipherSpec::from_config(
            &config.server.cipher,
            &config.server.key,
            &config.server.password,
        )?;
        let read_timeout = (config.server.client_read_timeout > 0)
            .then(|| Duration::from_secs(config.server.client_read_timeout));
        let write_timeout = (config.server.client_write_timeout > 0)
            .then(|| Duration::from_secs(config.server.client_write_timeout));

        Ok(Self {
            spec,
            filter,
            accounts,
            relay_opts: RelayOptions {
                read_timeout,
                write_timeout,
            },
            drain_timeout: read_timeout.unwrap_or(Duration::from_secs(30)),
            dialer: Dialer::default(),
        })
    }

    /// Credential envelope, then target address, then the account check.
    async fn read_head<S>(&self, stream: &mut S) -> Result<Address, ProxyError>
    where
        S: AsyncRead + Unpin,
    {
        let (user, pass) = envelope::read_from(stream).await?;
        let target = Address::read_from(stream).await?;
        if !self.accounts.valid(&user, &pass) {
            debug!(user = %user, "account rejected");
            return Err(ProxyError::AuthFailed);
        }
        Ok(target)
    }

    async fn connect_and_relay(
        &self,
        client: ProxyStream,
        target: Address,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        let remote = match self.dialer.connect_addr(&target).await {
            Ok(s) => s,
            Err(e) => {
                // no reply channel through the tunnel; just tear down
                debug!(peer = %peer, target = %target, error = %e, "target dial failed");
                return Err(e.into());
            }
        };
        let (up, down) = relay(client, remote, self.relay_opts).await?;
        debug!(peer = %peer, target = %target, up = up, down = down, "exit session done");
        Ok(())
    }
}

/// Discard whatever the peer keeps sending, for a bounded time.
async fn drain<R>(mut r: R, bound: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut sink = tokio::io::sink();
    let _ = tokio::time::timeout(bound, tokio::io::copy(&mut r, &mut sink)).await;
}

#[async_trait]
impl SessionHandler for ExitHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        if self.spec.kind().is_dummy() {
            let mut client: ProxyStream = Box::new(stream);
            match self.read_head(&mut client).await {
                Ok(target) => self.connect_and_relay(client, target, peer).await,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "handshake failed, draining");
                    drain(client, self.drain_timeout).await;
                    Ok(())
                }
            }
        } else {
            let mut client = AeadStream::new(stream, self.spec.clone(), self.filter.clone());
            match self.read_head(&mut client).await {
                Ok(target) => self.connect_and_relay(Box::new(client), target, peer).await,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "handshake failed, draining");
                    drain(client.into_inner(), self.drain_timeout).await;
                    Ok(())
                }
            }
        }
    }
}
