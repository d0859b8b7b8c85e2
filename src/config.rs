//! Control-plane configuration
//!
//! Names the configuration document the patcher rewrites, the network
//! interfaces and overlay prefix the applier renders into directives, and the
//! concrete ports of the fixed services (used when terminating established
//! sessions of a disabled policy).
//!
//! The recognizer comments inside the configuration document are part of the
//! contract with [`crate::core::policy::RECOGNIZERS`]; renaming them there
//! requires a lock-step table update, never a config change here.

use crate::utils::get_data_dir;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete control-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// The line-oriented configuration document loaded by the engine at boot
    #[serde(default = "default_nftables_conf")]
    pub nftables_conf: PathBuf,
    /// Ingress bridge for LAN traffic
    #[serde(default = "default_lan_interface")]
    pub lan_interface: String,
    /// Public (WAN) interface
    #[serde(default = "default_wan_interface")]
    pub wan_interface: String,
    /// Private overlay network prefix (CGNAT range used by the mesh VPN)
    #[serde(default = "default_overlay_network")]
    pub overlay_network: IpNetwork,
    #[serde(default)]
    pub service_ports: ServicePorts,
}

/// Concrete ports of the fixed TCP services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePorts {
    #[serde(default = "default_nodered_port")]
    pub nodered: u16,
    #[serde(default = "default_temporal_port")]
    pub temporal: u16,
    #[serde(default = "default_api_port")]
    pub api: u16,
    #[serde(default = "default_ssh_port")]
    pub ssh: u16,
    #[serde(default = "default_dns_port")]
    pub dns: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nftables_conf: default_nftables_conf(),
            lan_interface: default_lan_interface(),
            wan_interface: default_wan_interface(),
            overlay_network: default_overlay_network(),
            service_ports: ServicePorts::default(),
        }
    }
}

impl Default for ServicePorts {
    fn default() -> Self {
        Self {
            nodered: default_nodered_port(),
            temporal: default_temporal_port(),
            api: default_api_port(),
            ssh: default_ssh_port(),
            dns: default_dns_port(),
        }
    }
}

impl AppConfig {
    /// Port whose established sessions should be terminated when the given
    /// fixed policy is disabled.
    ///
    /// Only the three plain TCP services are covered: killing SSH sessions
    /// would sever the operator's own connection, and DNS is predominantly
    /// UDP with short-lived flows.
    pub fn termination_port(&self, key: crate::core::policy::PolicyKey) -> Option<u16> {
        use crate::core::policy::PolicyKey;
        match key {
            PolicyKey::NodeRed => Some(self.service_ports.nodered),
            PolicyKey::Temporal => Some(self.service_ports.temporal),
            PolicyKey::Api => Some(self.service_ports.api),
            _ => None,
        }
    }
}

fn default_nftables_conf() -> PathBuf {
    PathBuf::from("/etc/nftables.conf")
}

fn default_lan_interface() -> String {
    "br0".to_string()
}

fn default_wan_interface() -> String {
    "eth1".to_string()
}

fn default_overlay_network() -> IpNetwork {
    "100.64.0.0/10".parse().expect("static CIDR is valid")
}

fn default_nodered_port() -> u16 {
    1880
}

fn default_temporal_port() -> u16 {
    1889
}

fn default_api_port() -> u16 {
    8000
}

fn default_ssh_port() -> u16 {
    22
}

fn default_dns_port() -> u16 {
    53
}

/// Saves the config to disk using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    if let Some(mut path) = get_data_dir() {
        let json = serde_json::to_string_pretty(config)?;

        let mut temp_path = path.clone();
        temp_path.push("config.json.tmp");

        path.push("config.json");

        // Create file with restrictive permissions from the start to prevent
        // a window where the file is briefly world-readable
        #[cfg(unix)]
        {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp_path)
                .await?;

            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        #[cfg(not(unix))]
        {
            use tokio::io::AsyncWriteExt;

            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        tokio::fs::rename(temp_path, path).await?;
    }
    Ok(())
}

/// Loads the config from disk, or returns defaults if not found.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_config() -> AppConfig {
    if let Some(mut path) = get_data_dir() {
        path.push("config.json");
        if let Ok(json) = tokio::fs::read_to_string(&path).await
            && let Ok(config) = serde_json::from_str::<AppConfig>(&json)
        {
            return config;
        }
    }
    AppConfig::default()
}
