//! Edge (client-side) session orchestrator.
//!
//! Accepts plaintext SOCKS5 or HTTP proxy traffic, extracts the target
//! address, then opens the encrypted tunnel to the exit: dial upstream,
//! AEAD-wrap, optionally cork, send the credential envelope plus target,
//! and hand both streams to the relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::common::addr::Address;
use crate::common::dialer::Dialer;
use crate::common::error::ProxyError;
use crate::common::stream::{CorkStream, PrefixedStream, ProxyStream};
use crate::config::types::Config;
use crate::proxy::envelope;
use crate::proxy::http::{self, HttpKind};
use crate::proxy::relay::{relay, RelayOptions};
use crate::proxy::shadow::crypto::CipherSpec;
use crate::proxy::shadow::replay::SaltFilter;
use crate::proxy::socks5::{self, Reply, Socks5Server};

use super::listener::SessionHandler;

pub struct EdgeHandler {
    remote: Address,
    spec: CipherSpec,
    filter: Arc<SaltFilter>,
    username: String,
    password: String,
    socks: Socks5Server,
    cork: bool,
    relay_opts: RelayOptions,
    dialer: Dialer,
}

fn timeout_opt(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl EdgeHandler {
    pub fn new(config: &Config, filter: Arc<SaltFilter>) -> anyhow::Result<Self> {
        let remote = config
            .server
            .remote
            .clone()
            .ok_or_else(|| anyhow::anyhow!("edge role requires server.remote"))?;
        let spec = CipherSpec::from_config(
            &config.server.cipher,
            &config.server.key,
            &config.server.password,
        )?;
        // catch over-length credentials at startup, not per session
        envelope::encode(&config.auth.username, &config.auth.password)?;

        Ok(Self {
            remote,
            spec,
            filter,
            username: config.auth.username.clone(),
            password: config.auth.password.clone(),
            socks: Socks5Server::new(config.socks.credentials(), config.server.udp),
            cork: config.server.cork,
            relay_opts: RelayOptions {
                read_timeout: timeout_opt(config.server.client_read_timeout),
                write_timeout: timeout_opt(config.server.client_write_timeout),
            },
            dialer: Dialer::default(),
        })
    }

    /// Dial the exit and push the tunnel head: credential envelope, target
    /// address, and (for HTTP forward) the rebuilt request head, all in
    /// one plaintext write.
    async fn open_tunnel(
        &self,
        target: &Address,
        extra: Option<&[u8]>,
    ) -> Result<ProxyStream, ProxyError> {
        let tcp = self.dialer.connect_addr(&self.remote).await?;
        let wrapped = crate::proxy::shadow::wrap(Box::new(tcp), &self.spec, self.filter.clone());
        let mut upstream: ProxyStream = if self.cork {
            Box::new(CorkStream::new(wrapped))
        } else {
            wrapped
        };

        let block = envelope::encode(&self.username, &self.password)?;
        let mut head = Vec::with_capacity(envelope::ENVELOPE_LEN + target.serialized_len());
        head.extend_from_slice(&block);
        head.extend_from_slice(&target.to_bytes());
        if let Some(extra) = extra {
            head.extend_from_slice(extra);
        }
        upstream.write_all(&head).await?;

        debug!(target = %target, remote = %self.remote, "tunnel opened");
        Ok(upstream)
    }

    async fn handle_socks5(
        &self,
        mut stream: ProxyStream,
        peer: SocketAddr,
        local_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        self.socks.negotiate(&mut stream).await?;
        let req = self.socks.read_request(&mut stream).await?;

        if req.cmd == socks5::CMD_UDP_ASSOCIATE {
            // Acknowledge and hold the TCP side; the association dies with
            // it. Datagram relay is not implemented.
            Reply::success(local_addr).write_to(&mut stream).await?;
            info!(peer = %peer, "UDP associate held open");
            let mut sink = tokio::io::sink();
            let _ = tokio::io::copy(&mut stream, &mut sink).await;
            return Ok(());
        }

        match self.open_tunnel(&req.addr, None).await {
            Ok(upstream) => {
                Reply::success(local_addr).write_to(&mut stream).await?;
                let (up, down) = relay(stream, upstream, self.relay_opts).await?;
                debug!(peer = %peer, target = %req.addr, up = up, down = down, "SOCKS5 session done");
                Ok(())
            }
            Err(e) => {
                warn!(peer = %peer, target = %req.addr, error = %e, "upstream dial failed");
                Reply::error(socks5::rep_for_dial_error(&e))
                    .write_to(&mut stream)
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn handle_http(&self, stream: ProxyStream, peer: SocketAddr) -> anyhow::Result<()> {
        let (req, mut stream) = http::read_request(stream).await?;

        match req.kind {
            HttpKind::Connect => match self.open_tunnel(&req.target, None).await {
                Ok(upstream) => {
                    stream.write_all(http::CONNECT_ESTABLISHED).await?;
                    let (up, down) = relay(stream, upstream, self.relay_opts).await?;
                    debug!(peer = %peer, target = %req.target, up = up, down = down, "CONNECT session done");
                    Ok(())
                }
                Err(e) => {
                    warn!(peer = %peer, target = %req.target, error = %e, "upstream dial failed");
                    Err(e.into())
                }
            },
            HttpKind::Forward { head } => {
                let upstream = self.open_tunnel(&req.target, Some(&head)).await?;
                let (up, down) = relay(stream, upstream, self.relay_opts).await?;
                debug!(peer = %peer, target = %req.target, up = up, down = down, "HTTP forward session done");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SessionHandler for EdgeHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let local_addr = stream.local_addr()?;
        let mut stream: ProxyStream = Box::new(stream);

        // 读第一个字节判断协议，再放回流中
        let mut first = [0u8; 1];
        stream.read_exact(&mut first).await?;
        let stream: ProxyStream = Box::new(PrefixedStream::new(first.to_vec(), stream));

        if first[0] == socks5::VER {
            self.handle_socks5(stream, peer, local_addr).await
        } else {
            self.handle_http(stream, peer).await
        }
    }
}
