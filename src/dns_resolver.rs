use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;

/// TTL assumed when the lookup method does not expose one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const DOH_TIMEOUT: Duration = Duration::from_secs(5);

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;

/// Result of one lookup. A miss carries an already-expired instant so it
/// is never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Answer {
    pub addr: Option<IpAddr>,
    pub expires_at: Instant,
    /// A TCP handshake with `addr` on the looked-up port already succeeded.
    pub reachable: bool,
}

impl Answer {
    pub fn miss() -> Self {
        Self {
            addr: None,
            expires_at: Instant::now(),
            reachable: false,
        }
    }

    pub fn hit(addr: IpAddr, ttl: Duration) -> Self {
        Self {
            addr: Some(addr),
            expires_at: Instant::now() + ttl,
            reachable: false,
        }
    }

    pub fn reachable(self) -> Self {
        Self {
            reachable: true,
            ..self
        }
    }

    pub fn is_hit(&self) -> bool {
        self.addr.is_some()
    }
}

/// The one capability every lookup strategy provides.
///
/// `port` is the destination port of the connection being classified;
/// only strategies that probe the answer use it.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> Answer;
}

#[async_trait]
impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    async fn lookup(&self, host: &str, port: u16) -> Answer {
        (**self).lookup(host, port).await
    }
}

/// Operating-system resolver (plain UDP DNS on most hosts).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDnsResolver;

#[async_trait]
impl Resolve for SystemDnsResolver {
    async fn lookup(&self, host: &str, _port: u16) -> Answer {
        match tokio::net::lookup_host((host, 0)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => Answer::hit(addr.ip(), DEFAULT_TTL),
                None => Answer::miss(),
            },
            Err(_) => Answer::miss(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: i32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    #[serde(rename = "TTL")]
    ttl: u32,
    data: String,
}

/// Picks the first A/AAAA record of a JSON DoH response.
pub fn parse_doh_response(body: &[u8]) -> Answer {
    let response: DohResponse = match serde_json::from_slice(body) {
        Ok(response) => response,
        Err(_) => return Answer::miss(),
    };
    if response.status != 0 {
        return Answer::miss();
    }

    response
        .answer
        .iter()
        .find(|a| a.record_type == TYPE_A || a.record_type == TYPE_AAAA)
        .and_then(|a| {
            let addr = a.data.parse::<IpAddr>().ok()?;
            Some(Answer::hit(addr, Duration::from_secs(u64::from(a.ttl))))
        })
        .unwrap_or_else(Answer::miss)
}

/// DNS-over-HTTPS with JSON answers. Never fails: every problem is a miss.
pub struct DohResolver {
    client: reqwest::Client,
    provider: String,
}

impl DohResolver {
    pub fn new(client: reqwest::Client, provider: impl Into<String>) -> Self {
        Self {
            client,
            provider: provider.into(),
        }
    }

    async fn query(&self, host: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self
            .client
            .get(&self.provider)
            .query(&[("name", host)])
            .header("Accept", "application/dns-json")
            .timeout(DOH_TIMEOUT)
            .send()
            .await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl Resolve for DohResolver {
    async fn lookup(&self, host: &str, _port: u16) -> Answer {
        match self.query(host).await {
            Ok(body) => parse_doh_response(&body),
            Err(e) => {
                tracing::debug!(host, "DoH lookup failed: {}", e);
                Answer::miss()
            }
        }
    }
}

/// Static entries from a hosts file. No network I/O.
#[derive(Debug, Default, Clone)]
pub struct HostsFileResolver {
    entries: HashMap<String, IpAddr>,
}

impl HostsFileResolver {
    pub fn parse(contents: &str) -> Self {
        let mut entries = HashMap::new();
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next().and_then(|a| a.parse::<IpAddr>().ok()) else {
                continue;
            };
            for name in fields {
                // first mapping wins, like the system resolver
                entries.entry(name.to_ascii_lowercase()).or_insert(addr);
            }
        }
        Self { entries }
    }

    /// A missing or unreadable file yields an empty table.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) => {
                tracing::warn!("hosts file {} unavailable: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Resolve for HostsFileResolver {
    async fn lookup(&self, host: &str, _port: u16) -> Answer {
        match self.entries.get(&host.to_ascii_lowercase()) {
            Some(addr) => Answer::hit(*addr, DEFAULT_TTL),
            None => Answer::miss(),
        }
    }
}

/// Ordered strategies; the first hit wins and later ones are not consulted.
#[derive(Default)]
pub struct ResolverChain {
    strategies: Vec<Arc<dyn Resolve>>,
}

impl ResolverChain {
    pub fn new(strategies: Vec<Arc<dyn Resolve>>) -> Self {
        Self { strategies }
    }

    pub fn push(&mut self, strategy: Arc<dyn Resolve>) {
        self.strategies.push(strategy);
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[async_trait]
impl Resolve for ResolverChain {
    async fn lookup(&self, host: &str, port: u16) -> Answer {
        for strategy in &self.strategies {
            let answer = strategy.lookup(host, port).await;
            if answer.is_hit() {
                return answer;
            }
        }
        Answer::miss()
    }
}

/// Ten hex characters from the OS RNG; used as a subdomain that no
/// honest resolver can answer.
pub fn random_label() -> String {
    let mut id = [0u8; 5];
    OsRng.fill_bytes(&mut id);
    hex::encode(id)
}
