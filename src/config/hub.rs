//! YAML hub configuration
//!
//! ```yaml
//! server_ip: 203.0.113.10
//! port: 51820
//! private_key: <base64>
//! public_key: <base64>
//! ip: 10.8.0.1/24
//! ip_pool: 10.8.0.0/24
//! post_up: iptables -A FORWARD -i wg0 -j ACCEPT
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::crypto::x25519;
use crate::error::ConfigError;
use crate::pool::{AddressPool, PoolMode};

const fn default_port() -> u16 {
    51820
}

const fn default_keepalive() -> u16 {
    25
}

/// Interface hook commands, run by wg-quick around bringing the link up or down
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_up: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_up: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_down: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_down: Option<String>,
}

impl Hooks {
    /// Hooks in wg-quick order, paired with their config key; blank entries skipped
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("PreUp", &self.pre_up),
            ("PostUp", &self.post_up),
            ("PreDown", &self.pre_down),
            ("PostDown", &self.post_down),
        ]
        .into_iter()
        .filter_map(|(key, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        })
    }
}

/// Settings of the hub every peer connects through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Public address peers dial
    #[serde(default)]
    pub server_ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub private_key: String,
    /// Derived from `private_key` when left blank
    #[serde(default)]
    pub public_key: String,
    /// Hub tunnel address as written to its `Address` line, e.g. `10.8.0.1/24`
    #[serde(default)]
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
    /// Routing table name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// 0 leaves the MTU to wg-quick
    #[serde(default)]
    pub mtu: u16,
    #[serde(flatten)]
    pub hooks: Hooks,
    /// CIDR peers are allocated from
    #[serde(default)]
    pub ip_pool: String,
    #[serde(default)]
    pub pool_mode: PoolMode,
    /// Keepalive written into every provisioned peer
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,
}

impl HubConfig {
    /// Parse and validate a hub configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the fields provisioning depends on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_ip.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "server_ip".to_string(),
            });
        }
        if self.ip.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "ip".to_string(),
            });
        }
        if self.ip_pool.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "ip_pool".to_string(),
            });
        }
        self.tunnel_address()?;

        let pool = self.pool().map_err(|_| ConfigError::Parse {
            message: format!("ip_pool is not a valid IPv4 CIDR: {}", self.ip_pool),
        })?;
        if pool.capacity() == 0 {
            return Err(ConfigError::Parse {
                message: format!(
                    "ip_pool {} has no usable host addresses in {:?} mode",
                    pool, self.pool_mode
                ),
            });
        }

        Ok(())
    }

    /// Host part of `ip`, the hub's own address inside the tunnel
    pub fn tunnel_address(&self) -> Result<Ipv4Addr, ConfigError> {
        let value = self.ip.trim();
        value
            .parse::<Ipv4Net>()
            .map(|net| net.addr())
            .or_else(|_| value.parse::<Ipv4Addr>())
            .map_err(|_| ConfigError::InvalidAddress {
                value: value.to_string(),
            })
    }

    /// The allocation pool described by `ip_pool` and `pool_mode`
    pub fn pool(&self) -> Result<AddressPool, crate::error::PoolError> {
        AddressPool::parse(&self.ip_pool, self.pool_mode)
    }

    /// `host:port` peers use as their `Endpoint`
    pub fn endpoint(&self) -> String {
        let host = self.server_ip.trim();
        if host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Hub public key, derived from the private key when not configured
    pub fn resolved_public_key(&self) -> Option<String> {
        let configured = self.public_key.trim();
        if !configured.is_empty() {
            return Some(configured.to_string());
        }

        let private = self.private_key.trim();
        if private.is_empty() {
            return None;
        }
        match x25519::public_key_from_base64(private) {
            Ok(public) => Some(public),
            Err(e) => {
                tracing::warn!("Cannot derive hub public key: {}", e);
                None
            }
        }
    }
}

/// Load the hub configuration from a YAML file
pub fn load_hub_config<P: AsRef<Path>>(path: P) -> Result<HubConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
        } else {
            ConfigError::Io(e)
        }
    })?;

    let config = HubConfig::from_yaml_str(&content)?;
    tracing::debug!("Loaded hub config from {:?} (pool {})", path, config.ip_pool);
    Ok(config)
}
