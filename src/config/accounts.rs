//! Account store for the exit role.
//!
//! A flat JSON map of username → password, loaded once at startup.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::common::error::{ProxyError, Result};

pub trait Account: Send + Sync {
    /// Whether user and pass are both right. The user is trimmed before
    /// lookup; the password must match byte for byte.
    fn valid(&self, user: &str, pass: &str) -> bool;

    /// Whether the user exists, password ignored.
    fn exist(&self, user: &str) -> bool;
}

pub struct FileAccount {
    users: HashMap<String, String>,
}

impl FileAccount {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("read accounts file {}: {}", path.display(), e))
        })?;
        let users: HashMap<String, String> = serde_json::from_str(&content).map_err(|e| {
            ProxyError::Config(format!("parse accounts file {}: {}", path.display(), e))
        })?;
        info!(count = users.len(), "accounts loaded");
        Ok(Self { users })
    }

    pub fn from_map(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

impl Account for FileAccount {
    fn valid(&self, user: &str, pass: &str) -> bool {
        let u = user.trim();
        matches!(self.users.get(u), Some(v) if v == pass)
    }

    fn exist(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }
}
