//! Local agent: accepts browser connections on the HTTP or SOCKS5 front
//! end, classifies each destination and pumps bytes over the chosen path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::async_tunnel::{pump, AsyncStream, BoxedStream};
use crate::config::{FrontEnd, LocalConfig, StrategyKind};
use crate::core::observability;
use crate::direct_transport::dial_tcp;
use crate::dns_cache::CachedResolver;
use crate::dns_resolver::{DohResolver, HostsFileResolver, Resolve, ResolverChain, SystemDnsResolver};
use crate::error::Result;
use crate::http_head::{read_head, RequestHead};
use crate::ip_feed::RangeFeed;
use crate::ip_range::{RangeTable, SharedRangeTable};
use crate::relay_transport::{RelayDnsResolver, RelayTransport};
use crate::routing::{Decision, Destination, Route, Router};
use crate::smart_dns::SmartResolver;
use crate::socks5;

const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

pub struct LocalProxy {
    router: Router,
    relay: Arc<RelayTransport>,
    front_end: FrontEnd,
    dial_timeout: Duration,
}

impl LocalProxy {
    pub fn new(router: Router, relay: Arc<RelayTransport>, front_end: FrontEnd, dial_timeout: Duration) -> Self {
        Self {
            router,
            relay,
            front_end,
            dial_timeout,
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, front_end = ?self.front_end, "local agent listening");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    continue;
                }
            };
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                proxy.handle_connection(stream, peer).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        observability::record_connection_opened();
        let _closed = scopeguard::guard((), |_| observability::record_connection_closed());

        let _ = stream.set_nodelay(true);
        if let Err(e) = self.handle(stream).await {
            observability::record_error(e.class());
            tracing::debug!(%peer, "session ended: {}", e);
        }
    }

    /// Runs one client session to completion on the configured front end.
    pub async fn handle<S: AsyncStream>(&self, client: S) -> Result<()> {
        match self.front_end {
            FrontEnd::Http => self.serve_http(client).await,
            FrontEnd::Socks5 => self.serve_socks5(client).await,
        }
    }

    async fn classify(&self, destination: &Destination) -> Decision {
        let decision = self.router.classify(destination).await;
        match decision.route {
            Route::Direct => observability::record_direct_route(),
            Route::Relay => observability::record_relay_route(),
        }
        tracing::info!(host = %destination.host, port = destination.port, route = %decision.route, "session routed");
        decision
    }

    /// Opens the upstream leg. The returned bytes arrived from the relay
    /// ahead of the tunnel and belong to the client.
    async fn connect(&self, destination: &Destination, decision: &Decision) -> Result<(BoxedStream, Vec<u8>)> {
        match decision.route {
            Route::Direct => {
                let host = decision.dial_host(destination);
                let stream: BoxedStream = Box::new(dial_tcp(&host, destination.port, self.dial_timeout).await?);
                Ok((stream, Vec::new()))
            }
            Route::Relay => {
                let tunnel = self.relay.open_tunnel(destination).await?;
                Ok((tunnel.stream, tunnel.leftover))
            }
        }
    }

    async fn serve_http<S: AsyncStream>(&self, mut client: S) -> Result<()> {
        let (raw, leftover) = read_head(&mut client).await?;
        let parsed = RequestHead::parse(&raw).and_then(|head| {
            let (host, port) = head.destination()?;
            Ok((head, Destination::new(host, port)))
        });
        let (head, destination) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                let _ = client.write_all(BAD_REQUEST).await;
                return Err(e);
            }
        };

        let decision = self.classify(&destination).await;
        let (mut upstream, early) = match self.connect(&destination, &decision).await {
            Ok(upstream) => upstream,
            // a failed direct dial just closes; the relay path can still answer
            Err(e) if decision.route == Route::Relay => {
                let _ = client.write_all(SERVICE_UNAVAILABLE).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if head.is_connect() {
            client
                .write_all(format!("{} 200 OK\r\n\r\n", head.version).as_bytes())
                .await?;
        } else {
            upstream.write_all(&head.to_origin_bytes()?).await?;
        }
        if !early.is_empty() {
            client.write_all(&early).await?;
        }
        if !leftover.is_empty() {
            upstream.write_all(&leftover).await?;
        }
        client.flush().await?;
        upstream.flush().await?;

        pump(client, upstream).await;
        Ok(())
    }

    async fn serve_socks5<S: AsyncStream>(&self, mut client: S) -> Result<()> {
        let request = socks5::accept(&mut client).await?;
        let destination = request.destination();

        let decision = self.classify(&destination).await;
        let (upstream, early) = self.connect(&destination, &decision).await?;
        if !early.is_empty() {
            client.write_all(&early).await?;
            client.flush().await?;
        }

        pump(client, upstream).await;
        Ok(())
    }
}

/// Builds the configured resolver chain behind a shared cache.
pub fn build_resolver(config: &LocalConfig, client: &reqwest::Client, relay: &Arc<RelayTransport>) -> Arc<dyn Resolve> {
    let mut chain = ResolverChain::default();
    for kind in &config.strategies {
        let strategy: Arc<dyn Resolve> = match kind {
            StrategyKind::Hosts => Arc::new(HostsFileResolver::load(&config.hosts_file)),
            StrategyKind::System => Arc::new(SystemDnsResolver),
            StrategyKind::Doh => Arc::new(DohResolver::new(client.clone(), config.doh_provider.as_str())),
            StrategyKind::Smart => {
                let doh = Arc::new(DohResolver::new(client.clone(), config.doh_provider.as_str()));
                Arc::new(SmartResolver::new(Arc::new(SystemDnsResolver), doh).with_probe_timeout(config.probe_timeout()))
            }
            StrategyKind::Relay => Arc::new(RelayDnsResolver::new(Arc::clone(relay))),
        };
        chain.push(strategy);
    }
    Arc::new(CachedResolver::new(chain, config.cache_capacity))
}

/// Everything the local agent binary needs: the proxy, the live public
/// table and the feed that refreshes it.
pub struct LocalAgent {
    pub proxy: Arc<LocalProxy>,
    pub table: Arc<SharedRangeTable>,
    pub feed: RangeFeed,
}

impl LocalAgent {
    pub fn from_config(config: &LocalConfig) -> Result<Self> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        let relay = Arc::new(RelayTransport::new(
            config.relay_endpoint()?,
            config.secret_key.as_str(),
            config.dial_timeout(),
        )?);
        let resolver = build_resolver(config, &client, &relay);

        // seed ranges route directly until the first refresh lands
        let seed = if config.seed_ranges.is_empty() {
            RangeTable::default()
        } else {
            RangeTable::build(&config.seed_ranges)?
        };
        let table = Arc::new(SharedRangeTable::new(seed));

        let router = Router::new(Arc::clone(&table), resolver)
            .with_probe_timeout(config.probe_timeout())
            .with_auto_cross_firewall(config.auto_cross_firewall);
        let proxy = Arc::new(LocalProxy::new(router, relay, config.front_end, config.dial_timeout()));
        let feed = RangeFeed::new(
            client,
            config.feed_url.clone(),
            config.country_code.clone(),
            config.seed_ranges.clone(),
        );

        Ok(Self { proxy, table, feed })
    }
}
