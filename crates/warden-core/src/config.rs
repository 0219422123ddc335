//! Proxy configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file is a
//! valid configuration. The `[[clients]]` table seeds static per-client policy
//! for deployments without a management plane.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::network::LocalNetwork;
use crate::security::SecurityLevel;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8766;

/// Default health check path.
pub const DEFAULT_HEALTH_PATH: &str = "/__warden__/health";

/// Requests under this prefix are relayed to the policy service.
pub const DEFAULT_SPECIAL_PATH_PREFIX: &str = "/__warden__/";

/// Default content type pattern for matchers that omit one.
pub const DEFAULT_CONTENT_TYPE_REGEX: &str = "text/html.*";

/// Remote policy service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL, e.g. `http://127.0.0.1:8090/api`.
    pub base_url: String,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090/api".to_string(),
            timeout_secs: 3,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Streaming filter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Bytes buffered before a chunk is sent to the filter backend.
    pub chunk_size: usize,
    /// How long a "stop filtering" answer is remembered, in seconds.
    pub bypass_ttl_secs: u64,
    /// Content type pattern used when a matcher has none.
    pub default_content_type: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            bypass_ttl_secs: 600,
            default_content_type: DEFAULT_CONTENT_TYPE_REGEX.to_string(),
        }
    }
}

impl FilterConfig {
    pub fn bypass_ttl(&self) -> Duration {
        Duration::from_secs(self.bypass_ttl_secs)
    }
}

/// Connection decision cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a cached connection decision, in seconds.
    pub decision_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            decision_ttl_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn decision_ttl(&self) -> Duration {
        Duration::from_secs(self.decision_ttl_secs)
    }
}

/// Flex routing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlexConfig {
    /// Host the flex router ports listen on.
    pub tunnel_host: String,
    /// Timeout for re-proxied requests.
    pub timeout_secs: u64,
}

impl Default for FlexConfig {
    fn default() -> Self {
        Self {
            tunnel_host: "127.0.0.1".to_string(),
            timeout_secs: 30,
        }
    }
}

impl FlexConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Static policy for one client address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientPolicy {
    pub addr: String,
    pub security_level: Option<SecurityLevel>,
    /// Fqdns whose apps pin certificates.
    pub pinned: Vec<String>,
    pub flex_include: Vec<String>,
    pub flex_exclude: Vec<String>,
    pub show_block_stats: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Address the proxy listens on.
    pub listen_addr: SocketAddr,
    pub api: ApiConfig,
    /// Names and addresses of this proxy's own control plane.
    pub control_hosts: Vec<String>,
    /// Trusted upstream management services, never intercepted.
    pub management_hosts: Vec<String>,
    /// Networks clients are expected to come from.
    pub local_network: LocalNetwork,
    /// Host that is always intercepted to test CA trust.
    pub cert_probe_host: Option<String>,
    /// Where foreign plain-HTTP clients are sent.
    pub tarpit_url: String,
    pub health_path: String,
    /// Path prefix relayed to the policy service instead of upstream.
    pub special_path_prefix: String,
    /// Converts blocks into flagged intercepts for every client.
    pub show_block_stats: bool,
    /// Level assumed for clients without one in the policy store.
    pub default_security_level: SecurityLevel,
    pub filter: FilterConfig,
    pub cache: CacheConfig,
    pub flex: FlexConfig,
    /// CA directory (None = platform data dir).
    pub ca_dir: Option<PathBuf>,
    /// Activity database path (None = platform data dir).
    pub activity_db: Option<PathBuf>,
    /// Days of activity kept in the database.
    pub activity_retention_days: u32,
    pub clients: Vec<ClientPolicy>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PROXY_PORT)),
            api: ApiConfig::default(),
            control_hosts: Vec::new(),
            management_hosts: Vec::new(),
            local_network: LocalNetwork::private_defaults(),
            cert_probe_host: None,
            tarpit_url: "http://127.0.0.1:8080/".to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            special_path_prefix: DEFAULT_SPECIAL_PATH_PREFIX.to_string(),
            show_block_stats: false,
            default_security_level: SecurityLevel::Maximum,
            filter: FilterConfig::default(),
            cache: CacheConfig::default(),
            flex: FlexConfig::default(),
            ca_dir: None,
            activity_db: None,
            activity_retention_days: 30,
            clients: Vec::new(),
        }
    }
}

impl WardenConfig {
    /// Loads and validates a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!("Loaded config from {:?}", path.as_ref());
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "api.base_url must be an http(s) URL: {}",
                self.api.base_url
            )));
        }
        if self.api.timeout_secs == 0 {
            return Err(ConfigError::Invalid("api.timeout_secs must be > 0".into()));
        }
        if self.filter.chunk_size == 0 {
            return Err(ConfigError::Invalid("filter.chunk_size must be > 0".into()));
        }
        if !self.health_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "health_path must start with '/': {}",
                self.health_path
            )));
        }
        let prefix = &self.special_path_prefix;
        if prefix.len() < 3 || !prefix.starts_with('/') || !prefix.ends_with('/') {
            return Err(ConfigError::Invalid(format!(
                "special_path_prefix must be a non-root path between slashes: {}",
                prefix
            )));
        }
        if let Some(bad) = self.clients.iter().find(|c| c.addr.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("client entry without addr: {:?}", bad)));
        }
        Ok(())
    }

    /// Sets the listen address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Sets the policy service base URL.
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api.base_url = url.into();
        self
    }

    /// Adds a control-plane host.
    pub fn with_control_host(mut self, host: impl Into<String>) -> Self {
        self.control_hosts.push(host.into().to_lowercase());
        self
    }

    /// Adds a management service host.
    pub fn with_management_host(mut self, host: impl Into<String>) -> Self {
        self.management_hosts.push(host.into().to_lowercase());
        self
    }

    /// Sets the certificate probe host.
    pub fn with_cert_probe_host(mut self, host: impl Into<String>) -> Self {
        self.cert_probe_host = Some(host.into().to_lowercase());
        self
    }

    /// Sets the recognized client networks.
    pub fn with_local_network(mut self, network: LocalNetwork) -> Self {
        self.local_network = network;
        self
    }

    /// Enables or disables show-block-stats globally.
    pub fn with_show_block_stats(mut self, enabled: bool) -> Self {
        self.show_block_stats = enabled;
        self
    }

    /// Sets the filter chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.filter.chunk_size = size;
        self
    }

    /// True if `host` names this proxy's control plane.
    pub fn is_control_host(&self, host: &str) -> bool {
        contains_host(&self.control_hosts, host)
    }

    /// True if `host` is a trusted management service.
    pub fn is_management_host(&self, host: &str) -> bool {
        contains_host(&self.management_hosts, host)
    }

    /// True if `host` is the certificate probe host.
    pub fn is_cert_probe_host(&self, host: &str) -> bool {
        self.cert_probe_host
            .as_deref()
            .is_some_and(|probe| probe.eq_ignore_ascii_case(host))
    }
}

fn contains_host(hosts: &[String], host: &str) -> bool {
    hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
}
