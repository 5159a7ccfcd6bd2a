use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Which agent this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Local,
    Relay,
}

/// Front door the local agent exposes to client applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontEnd {
    Http,
    Socks5,
}

/// One entry of the ordered resolver chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Hosts,
    System,
    Doh,
    Smart,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Top-level configuration shared by both agents
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: AgentMode,
    pub listen_addr: String,
    pub log_level: LogLevel,
    pub local: LocalConfig,
    pub relay: RelayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: AgentMode::Local,
            listen_addr: "127.0.0.1:2286".to_string(),
            log_level: LogLevel::Info,
            local: LocalConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.mode {
            AgentMode::Local => self.local.validate(),
            AgentMode::Relay => self.relay.validate(),
        }
    }
}

/// Local agent settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub front_end: FrontEnd,
    /// `https://` dials the relay over TLS, `http://` in plaintext.
    pub relay_url: String,
    pub secret_key: String,
    /// When false every session takes the relay path.
    pub auto_cross_firewall: bool,
    pub dial_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub cache_capacity: usize,
    pub strategies: Vec<StrategyKind>,
    pub doh_provider: String,
    pub hosts_file: String,
    pub feed_url: String,
    pub country_code: String,
    pub seed_ranges: Vec<String>,
    pub refresh_interval_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            front_end: FrontEnd::Http,
            relay_url: "https://yourdomain.com:443".to_string(),
            secret_key: String::new(),
            auto_cross_firewall: true,
            dial_timeout_ms: 5_000,
            probe_timeout_ms: 100,
            cache_capacity: 8192,
            strategies: vec![StrategyKind::Hosts, StrategyKind::Smart],
            doh_provider: "https://cloudflare-dns.com/dns-query".to_string(),
            hosts_file: "/etc/hosts".to_string(),
            feed_url: "http://ftp.apnic.net/apnic/stats/apnic/delegated-apnic-latest".to_string(),
            country_code: "CN".to_string(),
            seed_ranges: Vec::new(),
            refresh_interval_secs: 4 * 60 * 60,
        }
    }
}

impl LocalConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn relay_endpoint(&self) -> Result<RelayEndpoint> {
        RelayEndpoint::parse(&self.relay_url)
    }

    fn validate(&self) -> Result<()> {
        if self.secret_key.is_empty() {
            return Err(Error::config("local.secret_key must not be empty"));
        }
        if self.cache_capacity == 0 {
            return Err(Error::config("local.cache_capacity must be positive"));
        }
        if self.strategies.is_empty() {
            return Err(Error::config("local.strategies must name at least one resolver"));
        }
        if self.refresh_interval_secs == 0 {
            return Err(Error::config("local.refresh_interval_secs must be positive"));
        }
        self.relay_endpoint()?;
        reqwest::Url::parse(&self.doh_provider)
            .map_err(|e| Error::config(format!("local.doh_provider: {}", e)))?;
        Ok(())
    }
}

/// Relay agent settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub secret_key: String,
    pub cover_website: String,
    pub dial_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            cover_website: "http://mirrors.codec-cluster.org/".to_string(),
            dial_timeout_ms: 5_000,
        }
    }
}

impl RelayConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.secret_key.is_empty() {
            return Err(Error::config("relay.secret_key must not be empty"));
        }
        let url = reqwest::Url::parse(&self.cover_website)
            .map_err(|e| Error::config(format!("relay.cover_website: {}", e)))?;
        if url.host_str().is_none() {
            return Err(Error::config("relay.cover_website has no host"));
        }
        Ok(())
    }
}

/// Where the local agent reaches its relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl RelayEndpoint {
    pub fn parse(relay_url: &str) -> Result<Self> {
        let url = reqwest::Url::parse(relay_url)
            .map_err(|e| Error::config(format!("relay_url {}: {}", relay_url, e)))?;
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(Error::config(format!("unsupported relay scheme {}", other))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::config("relay_url has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });
        Ok(Self { host, port, tls })
    }

    /// `Host` header value for requests sent to the relay.
    pub fn authority(&self) -> String {
        crate::http_head::join_host_port(&self.host, self.port)
    }
}
