use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Server configuration, loaded from a JSON file at startup. The DHCP
/// interface name, data directory, and ignore-anonymous toggle are CLI
/// flags, not config keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Primary IPv4 address of the DHCP interface. Returned as option 54
    /// on every OFFER/ACK/NAK and used to select a subnet for non-relayed
    /// clients.
    pub server_ip: Ipv4Addr,
    /// Management API listen port.
    pub api_port: u16,
    /// Basic Auth credentials for the management API.
    pub username: String,
    pub password: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            api_port: 6755,
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
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
        if self.api_port == 0 {
            return Err(Error::Validation("api_port must be non-zero".to_string()));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(Error::Validation(
                "username and password must be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Canonical MAC form used as the key of every lease and binding table:
/// lowercase hex, colon-separated.
pub fn normalize_mac(mac: &str) -> String {
    mac.to_lowercase().replace('-', ":")
}

pub fn is_valid_mac(mac: &str) -> bool {
    let normalized = normalize_mac(mac);
    let parts: Vec<&str> = normalized.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
}
