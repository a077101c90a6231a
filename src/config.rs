use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Server-level settings. Per-scope settings live in the scope files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory holding the `*.scope` files; created when absent.
    pub config_dir: PathBuf,

    /// The DNS server's own host name, used in bootstrap NS records.
    pub dns_server_name: String,

    /// Whether committed leases update the authoritative zones.
    pub dns_updates_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("scopes"),
            dns_server_name: "dhcp.local".to_string(),
            dns_updates_enabled: true,
        }
    }
}

impl ServerConfig {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: ServerConfig = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = ServerConfig::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.config_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "config_dir must not be empty".to_string(),
            ));
        }

        let sanitized = sanitize_domain_name(&self.dns_server_name);
        if sanitized.is_empty() || sanitized != self.dns_server_name {
            return Err(Error::InvalidConfig(format!(
                "invalid dns_server_name: {}",
                self.dns_server_name
            )));
        }

        Ok(())
    }
}

pub fn sanitize_hostname(hostname: &str) -> String {
    hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(255)
        .collect()
}

pub fn sanitize_domain_name(domain: &str) -> String {
    domain
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(255)
        .collect()
}
