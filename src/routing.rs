//! Per-connection choice between dialing the destination directly and
//! going through the relay.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::dns_resolver::Resolve;
use crate::http_head::join_host_port;
use crate::ip_range::{parse_ip_literal, RangeTable, SharedRangeTable, PRIVATE_RANGES};
use crate::smart_dns::{probe_tcp, DEFAULT_PROBE_TIMEOUT};

/// Where the client wants to go, as it asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_host_port(&self.host, self.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Relay,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => f.write_str("direct"),
            Route::Relay => f.write_str("relay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub route: Route,
    /// Literal or resolved address, when one was found.
    pub addr: Option<IpAddr>,
}

impl Decision {
    fn relay(addr: Option<IpAddr>) -> Self {
        Self {
            route: Route::Relay,
            addr,
        }
    }

    /// Host to dial on the direct path. The classified address is used so
    /// the dial never goes back to a possibly poisoned system resolver.
    pub fn dial_host(&self, destination: &Destination) -> String {
        match self.addr {
            Some(addr) => addr.to_string(),
            None => destination.host.clone(),
        }
    }
}

pub struct Router {
    public: Arc<SharedRangeTable>,
    private: Arc<RangeTable>,
    resolver: Arc<dyn Resolve>,
    probe_timeout: Duration,
    auto_cross_firewall: bool,
}

impl Router {
    pub fn new(public: Arc<SharedRangeTable>, resolver: Arc<dyn Resolve>) -> Self {
        Self {
            public,
            private: Arc::new(PRIVATE_RANGES.clone()),
            resolver,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            auto_cross_firewall: true,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// With auto-cross-firewall off, every destination goes to the relay.
    pub fn with_auto_cross_firewall(mut self, enabled: bool) -> Self {
        self.auto_cross_firewall = enabled;
        self
    }

    pub async fn classify(&self, destination: &Destination) -> Decision {
        if !self.auto_cross_firewall {
            return Decision::relay(None);
        }

        let (addr, reachable) = match parse_ip_literal(&destination.host) {
            Some(addr) => (Some(addr), false),
            None => {
                let answer = self.resolver.lookup(&destination.host, destination.port).await;
                (answer.addr, answer.reachable)
            }
        };
        // unknown destinations lean towards the relay
        let Some(addr) = addr else {
            tracing::debug!(%destination, "destination unresolved");
            return Decision::relay(None);
        };

        if self.public.contains(addr) {
            return Decision {
                route: Route::Direct,
                addr: Some(addr),
            };
        }

        // the resolver may have completed the handshake already
        if self.private.contains(addr)
            && (reachable || probe_tcp(SocketAddr::new(addr, destination.port), self.probe_timeout).await)
        {
            return Decision {
                route: Route::Direct,
                addr: Some(addr),
            };
        }

        Decision::relay(Some(addr))
    }
}
