//! Relay agent. Authorized requests get a tunnel or a DNS answer; every
//! other request is served from the cover site.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use subtle::ConstantTimeEq;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::async_tunnel::{pump, AsyncStream};
use crate::camouflage::CoverSite;
use crate::config::RelayConfig;
use crate::core::observability;
use crate::direct_transport::dial_tcp;
use crate::error::{Error, Result};
use crate::http_head::{read_head_or_partial, split_host_port, HeadRead, RequestHead, ResponseHead};
use crate::relay_transport::{DESTINATION_HEADER, DNS_QUERY_HEADER, SECRET_HEADER};

const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n";

pub struct RemoteProxy {
    secret: String,
    cover: CoverSite,
    dial_timeout: Duration,
}

impl RemoteProxy {
    pub fn new(secret: impl Into<String>, cover: CoverSite, dial_timeout: Duration) -> Self {
        Self {
            secret: secret.into(),
            cover,
            dial_timeout,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let cover = CoverSite::new(&config.cover_website)?;
        Ok(Self::new(config.secret_key.as_str(), cover, config.dial_timeout()))
    }

    /// Accept loop. With an acceptor, every connection is TLS-wrapped first.
    pub async fn run(self: Arc<Self>, listener: TcpListener, tls: Option<TlsAcceptor>) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, tls = tls.is_some(), "relay agent listening");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    continue;
                }
            };
            let proxy = Arc::clone(&self);
            let tls = tls.clone();
            tokio::spawn(async move {
                proxy.handle_connection(stream, peer, tls).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, tls: Option<TlsAcceptor>) {
        observability::record_connection_opened();
        let _closed = scopeguard::guard((), |_| observability::record_connection_closed());

        let result = match tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => self.handle(stream).await,
                Err(e) => Err(Error::Tls(format!("accept: {}", e))),
            },
            None => self.handle(stream).await,
        };
        if let Err(e) = result {
            observability::record_error(e.class());
            tracing::debug!(%peer, "relay session ended: {}", e);
        }
    }

    /// Serves one inbound connection. Whatever is not an authorized
    /// request, including bytes that are not HTTP at all, goes to the cover site.
    pub async fn handle<S: AsyncStream>(&self, mut stream: S) -> Result<()> {
        let (mut raw, leftover) = match read_head_or_partial(&mut stream).await? {
            HeadRead::Complete { raw, leftover } => (raw, leftover),
            HeadRead::Partial(received) if received.is_empty() => return Ok(()),
            HeadRead::Partial(received) => return self.cover.serve_raw(stream, received).await,
        };
        let mut head = match RequestHead::parse(&raw) {
            Ok(head) => head,
            Err(_) => {
                raw.extend_from_slice(&leftover);
                return self.cover.serve_raw(stream, raw).await;
            }
        };

        if self.is_authorized(&head) {
            if let Some(destination) = head.headers.remove(DESTINATION_HEADER) {
                return self.tunnel(stream, &destination, leftover).await;
            }
            if let Some(query) = head.headers.remove(DNS_QUERY_HEADER) {
                return self.answer_dns(stream, &query).await;
            }
        }
        self.cover.serve(stream, head, leftover).await
    }

    fn is_authorized(&self, head: &RequestHead) -> bool {
        head.headers
            .get(SECRET_HEADER)
            .is_some_and(|offered| bool::from(offered.as_bytes().ct_eq(self.secret.as_bytes())))
    }

    async fn tunnel<S: AsyncStream>(&self, mut client: S, destination: &str, leftover: Vec<u8>) -> Result<()> {
        let (host, port) = match split_host_port(destination, 443) {
            Ok(parsed) => parsed,
            Err(e) => {
                let _ = client.write_all(SERVICE_UNAVAILABLE).await;
                return Err(e);
            }
        };

        let mut target = match dial_tcp(&host, port, self.dial_timeout).await {
            Ok(target) => target,
            Err(e) => {
                let _ = client.write_all(SERVICE_UNAVAILABLE).await;
                return Err(e);
            }
        };

        client.write_all(TUNNEL_ESTABLISHED).await?;
        client.flush().await?;
        if !leftover.is_empty() {
            target.write_all(&leftover).await?;
        }

        tracing::debug!(%host, port, "relaying tunnel");
        pump(client, target).await;
        Ok(())
    }

    async fn answer_dns<S: AsyncStream>(&self, mut client: S, host: &str) -> Result<()> {
        let addr = match resolve_first(host).await {
            Ok(addr) => Some(addr),
            Err(e) => {
                observability::record_error(e.class());
                tracing::debug!("relay lookup failed: {}", e);
                None
            }
        };
        let mut response = match addr {
            Some(_) => ResponseHead::new(200, "OK"),
            None => ResponseHead::new(404, "Not Found"),
        };
        let body = addr.map(|addr| format!("{}\n", addr)).unwrap_or_default();
        response.headers.set("Content-Length", body.len().to_string());
        response.headers.set("Connection", "close");

        client.write_all(&response.to_bytes()).await?;
        client.write_all(body.as_bytes()).await?;
        client.flush().await?;
        let _ = client.shutdown().await;
        Ok(())
    }
}

async fn resolve_first(host: &str) -> Result<IpAddr> {
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| Error::Resolution(format!("{}: {}", host, e)))?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| Error::Resolution(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camouflage::tests::{fake_cover_site, recording_cover_site};
    use crate::http_head::read_head;
    use tokio::io::{duplex, AsyncReadExt};

    async fn proxy() -> RemoteProxy {
        let base = fake_cover_site(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\ncover").await;
        RemoteProxy::new("s3cret", CoverSite::new(&base).unwrap(), Duration::from_secs(2))
    }

    async fn exchange(proxy: &RemoteProxy, request: &str) -> String {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(request.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();
        let _ = proxy.handle(server).await;
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        String::from_utf8(raw).unwrap()
    }

    #[tokio::test]
    async fn test_missing_secret_gets_cover_site() {
        let proxy = proxy().await;
        let response = exchange(&proxy, "GET / HTTP/1.1\r\nHost: relay.test\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("cover"));
    }

    #[tokio::test]
    async fn test_wrong_secret_with_destination_gets_cover_site() {
        let proxy = proxy().await;
        let response = exchange(
            &proxy,
            "GET / HTTP/1.1\r\nHost: relay.test\r\nSandwich-Secret: guess\r\nSandwich-Destination: 127.0.0.1:9\r\n\r\n",
        )
        .await;
        assert!(response.ends_with("cover"));
    }

    #[tokio::test]
    async fn test_failed_dial_is_503() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let proxy = proxy().await;
        let request = format!(
            "GET / HTTP/1.1\r\nHost: relay.test\r\nSandwich-Secret: s3cret\r\nSandwich-Destination: 127.0.0.1:{}\r\n\r\n",
            port
        );
        let response = exchange(&proxy, &request).await;
        assert_eq!(response.as_bytes(), SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_dns_query_answers_literal() {
        let proxy = proxy().await;
        let response = exchange(
            &proxy,
            "GET / HTTP/1.1\r\nHost: relay.test\r\nSandwich-Secret: s3cret\r\nSandwich-Dns-Query: 127.0.0.1\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\n127.0.0.1\n"));
    }

    async fn recording_proxy(reply: &'static [u8]) -> (RemoteProxy, tokio::task::JoinHandle<Vec<u8>>) {
        let (base, received) = recording_cover_site(reply).await;
        let proxy = RemoteProxy::new("s3cret", CoverSite::new(&base).unwrap(), Duration::from_secs(2));
        (proxy, received)
    }

    #[tokio::test]
    async fn test_unparseable_head_goes_to_cover_site() {
        let (proxy, received) = recording_proxy(b"HTTP/1.1 400 Bad Request\r\nServer: mirror\r\n\r\noops").await;
        let response = exchange(&proxy, "\x16\x03\x01 hello\r\n\r\ntail").await;
        assert_eq!(response, "HTTP/1.1 400 Bad Request\r\nServer: mirror\r\n\r\noops");
        assert_eq!(received.await.unwrap(), b"\x16\x03\x01 hello\r\n\r\ntail");
    }

    #[tokio::test]
    async fn test_unterminated_head_goes_to_cover_site() {
        let (proxy, received) = recording_proxy(b"HTTP/1.1 408 Request Timeout\r\n\r\n").await;
        let response = exchange(&proxy, "GET / HTTP/1.1\r\nHost: rel").await;
        assert_eq!(response, "HTTP/1.1 408 Request Timeout\r\n\r\n");
        assert_eq!(received.await.unwrap(), b"GET / HTTP/1.1\r\nHost: rel");
    }

    #[tokio::test]
    async fn test_cover_site_sees_no_relay_headers() {
        let (proxy, received) = recording_proxy(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        exchange(
            &proxy,
            "GET /pool/ HTTP/1.1\r\nHost: relay.test\r\nSandwich-Secret: s3cret-but-longer\r\nSandwich-Dns-Query: example.com\r\n\r\n",
        )
        .await;

        let received = received.await.unwrap();
        let mut reader: &[u8] = &received;
        let (raw, _) = read_head(&mut reader).await.unwrap();
        let head = RequestHead::parse(&raw).unwrap();
        assert_eq!(head.target, "/pool/");
        assert_eq!(head.headers.get(SECRET_HEADER), None);
        assert_eq!(head.headers.get(DNS_QUERY_HEADER), None);
        assert_ne!(head.headers.get("Host"), Some("relay.test"));
    }

    #[tokio::test]
    async fn test_dns_query_miss_is_404() {
        let proxy = proxy().await;
        let response = exchange(
            &proxy,
            "GET / HTTP/1.1\r\nHost: relay.test\r\nSandwich-Secret: s3cret\r\nSandwich-Dns-Query: nowhere.invalid\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn test_secret_must_match_exactly() {
        let proxy = RemoteProxy::new(
            "s3cret",
            CoverSite::new("http://mirrors.example.org/").unwrap(),
            Duration::from_secs(2),
        );
        let mut head = RequestHead::new("GET", "/");
        assert!(!proxy.is_authorized(&head));
        for (offered, expected) in [("s3cret", true), ("s3cre", false), ("", false), ("S3CRET", false)] {
            head.headers.set(SECRET_HEADER, offered);
            assert_eq!(proxy.is_authorized(&head), expected, "{:?}", offered);
        }
    }
}
