//! Client side of the relay hop: opens tunnels and asks the relay to
//! resolve names from outside the firewall.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::async_tunnel::BoxedStream;
use crate::config::RelayEndpoint;
use crate::direct_transport::dial_tcp;
use crate::dns_resolver::{Answer, Resolve, DEFAULT_TTL};
use crate::error::{Error, Result};
use crate::http_head::{read_head, RequestHead, ResponseHead};
use crate::routing::Destination;
use crate::tls_wrapper::TlsWrapper;

pub const SECRET_HEADER: &str = "Sandwich-Secret";
pub const DESTINATION_HEADER: &str = "Sandwich-Destination";
pub const DNS_QUERY_HEADER: &str = "Sandwich-Dns-Query";

/// Largest DNS answer body we accept from the relay.
const MAX_DNS_BODY: usize = 256;

/// An accepted tunnel. `leftover` holds destination bytes that arrived
/// together with the relay's 200 and must reach the client first.
pub struct RelayTunnel {
    pub stream: BoxedStream,
    pub leftover: Vec<u8>,
}

pub struct RelayTransport {
    endpoint: RelayEndpoint,
    secret: String,
    tls: Option<TlsWrapper>,
    dial_timeout: Duration,
}

impl RelayTransport {
    pub fn new(endpoint: RelayEndpoint, secret: impl Into<String>, dial_timeout: Duration) -> Result<Self> {
        let tls = if endpoint.tls {
            Some(TlsWrapper::new()?)
        } else {
            None
        };
        Ok(Self {
            endpoint,
            secret: secret.into(),
            tls,
            dial_timeout,
        })
    }

    /// Replaces the platform-trusting TLS client, e.g. for a relay with a private CA.
    pub fn with_tls(mut self, tls: TlsWrapper) -> Self {
        self.tls = Some(tls);
        self
    }

    async fn dial(&self) -> Result<BoxedStream> {
        let tcp = dial_tcp(&self.endpoint.host, self.endpoint.port, self.dial_timeout).await?;
        let stream: BoxedStream = match &self.tls {
            Some(tls) => Box::new(tls.connect(tcp, &self.endpoint.host).await?),
            None => Box::new(tcp),
        };
        Ok(stream)
    }

    fn request(&self, header: &str, value: String) -> RequestHead {
        let mut head = RequestHead::new("GET", "/");
        head.headers.set("Host", self.endpoint.authority());
        head.headers.set(SECRET_HEADER, self.secret.as_str());
        head.headers.set(header, value);
        head
    }

    /// Sends `request` on a fresh relay connection and reads the reply head.
    async fn exchange(&self, request: RequestHead) -> Result<(BoxedStream, ResponseHead, Vec<u8>)> {
        let mut stream = self.dial().await?;
        stream.write_all(&request.to_bytes()).await?;
        stream.flush().await?;

        let (raw, leftover) = read_head(&mut stream).await?;
        let response = ResponseHead::parse(&raw)?;
        Ok((stream, response, leftover))
    }

    /// Asks the relay to dial `destination` and returns the piped stream.
    pub async fn open_tunnel(&self, destination: &Destination) -> Result<RelayTunnel> {
        let request = self.request(DESTINATION_HEADER, destination.to_string());
        let (stream, response, leftover) = self.exchange(request).await?;
        if !response.is_success() {
            return Err(Error::RelayRejected(response.status));
        }
        tracing::debug!(%destination, relay = %self.endpoint.authority(), "relay tunnel open");
        Ok(RelayTunnel { stream, leftover })
    }

    /// Resolves `host` on the relay. `Ok(None)` means the relay found nothing.
    pub async fn lookup(&self, host: &str) -> Result<Option<IpAddr>> {
        let request = self.request(DNS_QUERY_HEADER, host.to_string());
        let (mut stream, response, mut body) = self.exchange(request).await?;
        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(Error::RelayRejected(response.status));
        }

        let len = response.headers.content_length().unwrap_or(body.len());
        if len > MAX_DNS_BODY {
            return Err(Error::address("oversized relay dns answer"));
        }
        if body.len() < len {
            let start = body.len();
            body.resize(len, 0);
            stream.read_exact(&mut body[start..]).await?;
        }
        body.truncate(len);

        let text = String::from_utf8_lossy(&body);
        text.trim()
            .parse::<IpAddr>()
            .map(Some)
            .map_err(|_| Error::address(format!("relay dns answer {:?}", text.trim())))
    }
}

/// Resolver strategy that asks the relay, useful when every local
/// resolver is tampered with.
pub struct RelayDnsResolver {
    transport: Arc<RelayTransport>,
}

impl RelayDnsResolver {
    pub fn new(transport: Arc<RelayTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Resolve for RelayDnsResolver {
    async fn lookup(&self, host: &str, _port: u16) -> Answer {
        match self.transport.lookup(host).await {
            Ok(Some(addr)) => Answer::hit(addr, DEFAULT_TTL),
            Ok(None) => Answer::miss(),
            Err(e) => {
                tracing::debug!(host, "relay dns lookup failed: {}", e);
                Answer::miss()
            }
        }
    }
}
