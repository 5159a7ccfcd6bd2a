//! Plain resolution with tamper detection and DNS-over-HTTPS escalation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::core::observability;
use crate::dns_resolver::{random_label, Answer, Resolve};
use crate::ip_range::{RangeTable, PRIVATE_RANGES};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// True when a TCP handshake with `addr` completes within `timeout`.
pub async fn probe_tcp(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

pub struct SmartResolver {
    plain: Arc<dyn Resolve>,
    doh: Arc<dyn Resolve>,
    private: Arc<RangeTable>,
    probe_timeout: Duration,
}

impl SmartResolver {
    pub fn new(plain: Arc<dyn Resolve>, doh: Arc<dyn Resolve>) -> Self {
        Self {
            plain,
            doh,
            private: Arc::new(PRIVATE_RANGES.clone()),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Resolves a random subdomain of `domain` through the plain strategy.
    /// Any answer means the plain path fabricates records for this domain.
    pub async fn is_blocked_by_gfw(&self, domain: &str) -> bool {
        let nonexistent = format!("{}.{}", random_label(), domain);
        self.plain.lookup(&nonexistent, 0).await.is_hit()
    }

    async fn escalate(&self, host: &str, port: u16) -> Answer {
        observability::record_doh_escalation();
        self.doh.lookup(host, port).await
    }
}

#[async_trait]
impl Resolve for SmartResolver {
    async fn lookup(&self, host: &str, port: u16) -> Answer {
        let answer = self.plain.lookup(host, port).await;

        if let Some(addr) = answer.addr.filter(|a| self.private.contains(*a)) {
            if probe_tcp(SocketAddr::new(addr, port), self.probe_timeout).await {
                return answer.reachable();
            }
            tracing::debug!(host, %addr, "private answer unreachable, escalating to DoH");
            return self.escalate(host, port).await;
        }

        if self.is_blocked_by_gfw(host).await {
            tracing::debug!(host, "plain DNS is poisoned, escalating to DoH");
            return self.escalate(host, port).await;
        }

        answer
    }
}
