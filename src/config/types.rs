use serde::Deserialize;

use crate::common::addr::Address;
use crate::common::error::{ProxyError, Result};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub socks: SocksAuthConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, "host:port"
    pub listen: String,
    /// Upstream exit, "host:port" — edge role only
    pub remote: Option<Address>,
    pub cipher: String,
    /// base64 PSK; empty → derive from password
    pub key: String,
    pub password: String,
    /// settings of communicating with the client, in seconds; 0 disables
    pub client_read_timeout: u64,
    pub client_write_timeout: u64,
    /// graceful shutdown timeout, in seconds
    pub graceful_shutdown_timeout: u64,
    /// accept SOCKS5 UDP-ASSOCIATE
    pub udp: bool,
    /// coalesce handshake writes toward the exit
    pub cork: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8388".to_string(),
            remote: None,
            cipher: "AEAD_AES_128_GCM".to_string(),
            key: String::new(),
            password: String::new(),
            client_read_timeout: 60,
            client_write_timeout: 60,
            graceful_shutdown_timeout: 10,
            udp: false,
            cork: true,
        }
    }
}

/// Tunnel credentials (edge) and the account table (exit).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    pub accounts_file: String,
}

/// Optional client-facing SOCKS5 user/pass auth at the edge.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SocksAuthConfig {
    pub username: String,
    pub password: String,
}

impl SocksAuthConfig {
    pub fn credentials(&self) -> Option<(String, String)> {
        if self.username.is_empty() {
            None
        } else {
            Some((self.username.clone(), self.password.clone()))
        }
    }
}

impl Config {
    /// Checks shared by both roles; role-specific requirements live in
    /// the App constructors.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen.is_empty() {
            return Err(ProxyError::Config("server.listen is required".to_string()));
        }
        if self.server.cipher.is_empty() {
            return Err(ProxyError::Config("server.cipher is required".to_string()));
        }
        if self.server.key.is_empty() && self.server.password.is_empty() {
            return Err(ProxyError::Config(
                "one of server.key or server.password is required".to_string(),
            ));
        }
        Ok(())
    }
}
