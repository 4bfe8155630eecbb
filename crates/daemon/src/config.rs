//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// SSH access to the gateway host
    pub ssh: SshConfig,

    /// WireGuard gateway configuration
    pub wireguard: WireguardConfig,

    /// Payment configuration
    pub payment: PaymentConfig,

    /// Reaper configuration
    pub reaper: ReaperConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: wirevend_common::default_store_path(),
            ssh: SshConfig::default(),
            wireguard: WireguardConfig::default(),
            payment: PaymentConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

/// SSH connection settings for the gateway host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,

    /// Private key file; password auth is deliberately unsupported
    pub key_path: Option<PathBuf>,

    /// Per-command timeout in seconds
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: "root".to_string(),
            key_path: None,
            command_timeout_secs: 30,
        }
    }
}

/// WireGuard gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardConfig {
    /// Path of the gateway's own config on the remote host
    pub server_config_path: String,

    /// Externally reachable address; falls back to the SSH host
    pub endpoint_host: Option<String>,

    /// First assignable client address
    pub pool_start: Ipv4Addr,

    /// Last assignable client address (inclusive)
    pub pool_end: Ipv4Addr,

    /// DNS servers pushed to clients
    pub dns_servers: Vec<Ipv4Addr>,

    /// PersistentKeepalive interval for clients
    pub keepalive_secs: u16,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            server_config_path: "/etc/wireguard/wg0.conf".to_string(),
            endpoint_host: None,
            pool_start: Ipv4Addr::new(10, 0, 0, 2),
            pool_end: Ipv4Addr::new(10, 0, 0, 254),
            dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
            keepalive_secs: 25,
        }
    }
}

impl WireguardConfig {
    /// Interface name the `wg`/`wg-quick` tooling expects, derived from the
    /// config file name (wg0.conf -> wg0)
    pub fn interface(&self) -> String {
        Path::new(&self.server_config_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "wg0".to_string())
    }
}

/// Payment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Price per day of access
    pub price_per_day: f64,

    /// Shortest purchasable duration
    pub min_days: u32,

    /// Longest purchasable duration
    pub max_days: u32,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            price_per_day: 10.0,
            min_days: 1,
            max_days: 365,
        }
    }
}

/// Reaper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Interval between reap cycles
    pub cycle_secs: u64,

    /// Retry interval after a failed scan
    pub backoff_secs: u64,

    /// Age after which a provisional key is considered stranded
    pub provisional_timeout_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            cycle_secs: 3600,
            backoff_secs: 60,
            provisional_timeout_secs: 900,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Endpoint clients connect to; the SSH host unless overridden
    pub fn endpoint_host(&self) -> String {
        self.wireguard
            .endpoint_host
            .clone()
            .unwrap_or_else(|| self.ssh.host.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_from_config_path() {
        let mut wg = WireguardConfig::default();
        assert_eq!(wg.interface(), "wg0");
        wg.server_config_path = "/etc/wireguard/wg-clients.conf".to_string();
        assert_eq!(wg.interface(), "wg-clients");
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = DaemonConfig::default();
        config.ssh.host = "vpn.example.com".to_string();
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.ssh.host, "vpn.example.com");
        assert_eq!(loaded.wireguard.pool_start, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(loaded.endpoint_host(), "vpn.example.com");
    }
}
