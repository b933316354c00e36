//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The gateway token is loaded from ISSUER_GATEWAY_TOKEN or token_file,
//! never stored in the TOML directly to avoid leaking secrets.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use issuance::IssuanceConfig;
use serde::Deserialize;

/// Env var holding the gateway bearer token.
pub const GATEWAY_TOKEN_ENV: &str = "ISSUER_GATEWAY_TOKEN";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub admin: AdminConfig,
    pub store: StoreConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub proxies: ProxiesConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

/// Admin HTTP API settings
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// JSON state file, created on first write.
    pub path: PathBuf,
}

/// Platform gateway sidecar
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
    /// Path to a file containing the token (alternative to ISSUER_GATEWAY_TOKEN)
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_code_wait")]
    pub code_wait_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct ProxiesConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Look up the country of a proxy's exit IP after successful probes.
    #[serde(default = "default_true")]
    pub geo_lookup: bool,
}

#[derive(Debug, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_max_active")]
    pub max_active_per_requester: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            code_wait_timeout_secs: default_code_wait(),
        }
    }
}

impl Default for ProxiesConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_url: default_probe_url(),
            probe_timeout_secs: default_probe_timeout(),
            geo_lookup: true,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_active_per_requester: default_max_active(),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_gateway_timeout() -> u64 {
    30
}

fn default_code_wait() -> u64 {
    180
}

fn default_probe_interval() -> u64 {
    300
}

fn default_probe_url() -> String {
    "https://api.ipify.org".into()
}

fn default_probe_timeout() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_max_active() -> usize {
    3
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Gateway token resolution order:
    /// 1. ISSUER_GATEWAY_TOKEN env var
    /// 2. token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(token) = std::env::var(GATEWAY_TOKEN_ENV) {
            config.gateway.token = Some(Secret::new(token));
        } else if let Some(ref token_file) = config.gateway.token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.gateway.token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.gateway.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "gateway.base_url must start with http:// or https://, got: {base_url}"
            )));
        }
        if self.gateway.timeout_secs == 0 {
            return Err(common::Error::Config(
                "gateway.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "admin.max_connections must be greater than 0".into(),
            ));
        }
        let wait = self.listener.code_wait_timeout_secs;
        if !(30..=600).contains(&wait) {
            return Err(common::Error::Config(format!(
                "listener.code_wait_timeout_secs must be between 30 and 600, got: {wait}"
            )));
        }
        if self.proxies.probe_interval_secs == 0 || self.proxies.probe_timeout_secs == 0 {
            return Err(common::Error::Config(
                "proxies.probe_interval_secs and probe_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.quota.max_active_per_requester == 0 {
            return Err(common::Error::Config(
                "quota.max_active_per_requester must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("credential-issuer.toml")
    }

    pub fn issuance(&self) -> IssuanceConfig {
        IssuanceConfig {
            code_wait: Duration::from_secs(self.listener.code_wait_timeout_secs),
            max_active_per_requester: self.quota.max_active_per_requester,
            ..IssuanceConfig::default()
        }
    }
}
