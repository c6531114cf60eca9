pub mod edge;
pub mod exit;
pub mod listener;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::accounts::FileAccount;
use crate::config::types::Config;
use crate::proxy::shadow::replay::SaltFilter;

use edge::EdgeHandler;
use exit::ExitHandler;
use listener::SessionHandler;

/// Which half of the tunnel this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts plaintext SOCKS5/HTTP clients, forwards over the tunnel.
    Edge,
    /// Terminates the tunnel, dials the true destination.
    Exit,
}

pub struct App {
    listen: String,
    graceful_timeout: Duration,
    handler: Arc<dyn SessionHandler>,
    cancel: CancellationToken,
}

impl App {
    pub fn new(role: Role, config: &Config) -> anyhow::Result<Self> {
        config.validate()?;

        // exactly one process-wide salt filter
        let filter = Arc::new(SaltFilter::new());

        let handler: Arc<dyn SessionHandler> = match role {
            Role::Edge => Arc::new(EdgeHandler::new(config, filter)?),
            Role::Exit => {
                if config.auth.accounts_file.is_empty() {
                    anyhow::bail!("exit role requires auth.accounts_file");
                }
                let accounts =
                    Arc::new(FileAccount::load(Path::new(&config.auth.accounts_file))?);
                Arc::new(ExitHandler::new(config, filter, accounts)?)
            }
        };

        info!(role = ?role, listen = %config.server.listen, cipher = %config.server.cipher, "app configured");

        Ok(Self {
            listen: config.server.listen.clone(),
            graceful_timeout: Duration::from_secs(config.server.graceful_shutdown_timeout),
            handler,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that triggers graceful shutdown when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        Ok(TcpListener::bind(&self.listen).await?)
    }

    /// Serve on an already-bound listener (lets tests bind port 0 first).
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        listener::serve(listener, self.handler, self.cancel, self.graceful_timeout).await
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = self.bind().await?;

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });

        self.serve(listener).await
    }
}
