//! Whole-path scenarios over real loopback sockets: local agent, relay
//! agent, a cover site and an echo destination.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::camouflage::tests::fake_cover_site;
use crate::camouflage::CoverSite;
use crate::config::{FrontEnd, RelayEndpoint};
use crate::dns_cache::CachedResolver;
use crate::dns_resolver::tests::ScriptedResolver;
use crate::dns_resolver::{parse_doh_response, Resolve};
use crate::error::Error;
use crate::http_head::{read_head, ResponseHead};
use crate::ip_feed::parse_feed_line;
use crate::ip_range::{RangeTable, SharedRangeTable};
use crate::local_proxy::LocalProxy;
use crate::relay_transport::{RelayDnsResolver, RelayTransport};
use crate::remote_proxy::RemoteProxy;
use crate::routing::{Destination, Route, Router};
use crate::smart_dns::SmartResolver;
use crate::socks5;
use crate::tls_wrapper::TlsWrapper;

const COVER_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 14\r\nConnection: close\r\n\r\nnothing to see";

/// Unusual reason phrase, mixed-case names and no `Connection` header.
const KEEP_ALIVE_RESPONSE: &[u8] =
    b"HTTP/1.1 200 Fine\r\nX-Served-By: Mirror-7\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok";

/// Echo server accepting any number of connections.
async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    port
}

async fn start_relay(secret: &str) -> (u16, String) {
    start_relay_with(secret, COVER_RESPONSE, None).await
}

async fn start_relay_with(secret: &str, cover_response: &'static [u8], tls: Option<TlsAcceptor>) -> (u16, String) {
    let cover_base = fake_cover_site(cover_response).await;
    let proxy = Arc::new(RemoteProxy::new(
        secret,
        CoverSite::new(&cover_base).unwrap(),
        Duration::from_secs(2),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(proxy.run(listener, tls));
    (port, cover_base)
}

/// Server side signed by the test CA for `localhost` and `127.0.0.1`.
fn relay_tls_acceptor() -> TlsAcceptor {
    let cert = rustls::Certificate(include_bytes!("testdata/relay.der").to_vec());
    let key = rustls::PrivateKey(include_bytes!("testdata/relay.key.der").to_vec());
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

fn client_tls(trust_test_ca: bool) -> TlsWrapper {
    let mut roots = rustls::RootCertStore::empty();
    if trust_test_ca {
        roots
            .add(&rustls::Certificate(include_bytes!("testdata/ca.der").to_vec()))
            .unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsWrapper::from_config(Arc::new(config))
}

fn tls_relay_transport(port: u16, secret: &str, trust_test_ca: bool) -> RelayTransport {
    let endpoint = RelayEndpoint {
        host: "localhost".to_string(),
        port,
        tls: false,
    };
    RelayTransport::new(endpoint, secret, Duration::from_secs(2))
        .unwrap()
        .with_tls(client_tls(trust_test_ca))
}

/// Sends one GET and collects everything until the server closes.
async fn visit(port: u16) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: relay.test\r\nUser-Agent: curl/8.0\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    raw
}

fn relay_transport(port: u16, secret: &str) -> RelayTransport {
    let endpoint = RelayEndpoint {
        host: "127.0.0.1".to_string(),
        port,
        tls: false,
    };
    RelayTransport::new(endpoint, secret, Duration::from_secs(2)).unwrap()
}

async fn start_local(table: RangeTable, relay_port: u16, secret: &str, front_end: FrontEnd) -> u16 {
    let router = Router::new(
        Arc::new(SharedRangeTable::new(table)),
        Arc::new(ScriptedResolver::new(&[])),
    );
    let relay = Arc::new(relay_transport(relay_port, secret));
    let proxy = Arc::new(LocalProxy::new(router, relay, front_end, Duration::from_secs(2)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(proxy.run(listener));
    port
}

async fn read_response(stream: &mut TcpStream) -> (ResponseHead, Vec<u8>) {
    let (raw, mut body) = read_head(stream).await.unwrap();
    let head = ResponseHead::parse(&raw).unwrap();
    if let Some(len) = head.headers.content_length() {
        let start = body.len();
        body.resize(len, 0);
        stream.read_exact(&mut body[start..]).await.unwrap();
    }
    (head, body)
}

#[test]
fn test_feed_line_to_membership() {
    let cidr = parse_feed_line("apnic|CN|ipv4|1.0.1.0|256|20110414|allocated", "CN").unwrap();
    assert_eq!(cidr, "1.0.1.0/24");

    let table = RangeTable::build([cidr]).unwrap();
    assert!(table.contains_host("1.0.1.5"));
    assert!(!table.contains_host("1.0.2.5"));
}

#[test]
fn test_doh_answer_expiry() {
    let answer = parse_doh_response(
        br#"{"Status":0,"Answer":[{"type":1,"TTL":300,"data":"93.184.216.34"}]}"#,
    );
    assert_eq!(answer.addr, Some("93.184.216.34".parse().unwrap()));
    let remaining = answer.expires_at.saturating_duration_since(Instant::now());
    assert!(remaining > Duration::from_secs(295) && remaining <= Duration::from_secs(300));
}

#[tokio::test]
async fn test_poisoned_domain_routes_on_doh_answer() {
    // the tampering resolver answers every name under blocked.example
    let plain = Arc::new(
        ScriptedResolver::new(&[("blocked.example", "243.185.187.39")])
            .with_wildcard("blocked.example", "243.185.187.39"),
    );
    let doh = Arc::new(ScriptedResolver::new(&[("blocked.example", "1.0.1.9")]));
    let resolver = CachedResolver::new(SmartResolver::new(plain, doh.clone()), 16);

    let listed = RangeTable::build(["1.0.1.0/24"]).unwrap();
    let router = Router::new(Arc::new(SharedRangeTable::new(listed)), Arc::new(resolver));

    let destination = Destination::new("blocked.example", 443);
    for _ in 0..2 {
        let decision = router.classify(&destination).await;
        assert_eq!(decision.route, Route::Direct);
        assert_eq!(decision.addr, Some("1.0.1.9".parse().unwrap()));
    }
    // the second classification is served from the cache
    assert_eq!(doh.calls(), 1);
}

#[tokio::test]
async fn test_connect_to_listed_literal_goes_direct() {
    let echo = echo_server().await;
    let listed = RangeTable::build(["127.0.0.0/8"]).unwrap();
    // the relay is never used on this path
    let local = start_local(listed, 9, "s3cret", FrontEnd::Http).await;

    let mut client = TcpStream::connect(("127.0.0.1", local)).await.unwrap();
    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", echo, echo);
    client.write_all(request.as_bytes()).await.unwrap();

    let mut reply = [0u8; 19];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"HTTP/1.1 200 OK\r\n\r\n");

    client.write_all(b"direct bytes").await.unwrap();
    let mut echoed = [0u8; 12];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"direct bytes");
}

#[tokio::test]
async fn test_relay_tunnels_with_secret() {
    let echo = echo_server().await;
    let (relay, _) = start_relay("s3cret").await;

    let tunnel = relay_transport(relay, "s3cret")
        .open_tunnel(&Destination::new("127.0.0.1", echo))
        .await
        .unwrap();
    assert!(tunnel.leftover.is_empty());

    let mut stream = tunnel.stream;
    stream.write_all(b"through the relay").await.unwrap();
    let mut echoed = [0u8; 17];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"through the relay");
}

#[tokio::test]
async fn test_relay_without_secret_serves_cover_site() {
    let echo = echo_server().await;
    let (relay, _) = start_relay("s3cret").await;

    let mut probe = TcpStream::connect(("127.0.0.1", relay)).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: relay.test\r\nSandwich-Destination: 127.0.0.1:{}\r\n\r\n",
        echo
    );
    probe.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut probe).await;
    assert_eq!(head.status, 200);
    assert_eq!(body, b"nothing to see");
}

#[tokio::test]
async fn test_camouflage_matches_direct_cover_visit() {
    let (relay, cover_base) = start_relay("s3cret").await;
    let cover_port = reqwest::Url::parse(&cover_base).unwrap().port().unwrap();

    let direct = visit(cover_port).await;
    let relayed = visit(relay).await;
    // status line, header names and order, and body, byte for byte
    assert_eq!(relayed, direct);
    assert_eq!(direct, COVER_RESPONSE);
}

#[tokio::test]
async fn test_camouflage_keeps_connection_alive_like_cover_site() {
    let (relay, _) = start_relay_with("s3cret", KEEP_ALIVE_RESPONSE, None).await;

    let mut probe = TcpStream::connect(("127.0.0.1", relay)).await.unwrap();
    for path in ["/", "/second"] {
        let request = format!("GET {} HTTP/1.1\r\nHost: relay.test\r\n\r\n", path);
        probe.write_all(request.as_bytes()).await.unwrap();
        let mut raw = vec![0u8; KEEP_ALIVE_RESPONSE.len()];
        probe.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, KEEP_ALIVE_RESPONSE);
    }
}

#[tokio::test]
async fn test_http_front_end_through_relay() {
    let echo = echo_server().await;
    let (relay, _) = start_relay("s3cret").await;
    // the scripted resolver knows no names, so "localhost" goes through the relay
    let local = start_local(RangeTable::default(), relay, "s3cret", FrontEnd::Http).await;

    let mut client = TcpStream::connect(("127.0.0.1", local)).await.unwrap();
    let request = format!("CONNECT localhost:{} HTTP/1.1\r\nHost: localhost:{}\r\n\r\n", echo, echo);
    client.write_all(request.as_bytes()).await.unwrap();

    let mut reply = [0u8; 19];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"HTTP/1.1 200 OK\r\n\r\n");

    client.write_all(b"hello relay").await.unwrap();
    let mut echoed = [0u8; 11];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello relay");
}

#[tokio::test]
async fn test_socks5_front_end_through_relay() {
    let echo = echo_server().await;
    let (relay, _) = start_relay("s3cret").await;
    let local = start_local(RangeTable::default(), relay, "s3cret", FrontEnd::Socks5).await;

    let mut client = TcpStream::connect(("127.0.0.1", local)).await.unwrap();
    let mut frames = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 9];
    frames.extend_from_slice(b"localhost");
    frames.extend_from_slice(&echo.to_be_bytes());
    client.write_all(&frames).await.unwrap();

    let mut replies = [0u8; 12];
    client.read_exact(&mut replies).await.unwrap();
    assert_eq!(&replies[..2], &[0x05, 0x00]);
    assert_eq!(&replies[2..], &socks5::SUCCESS_REPLY);

    client.write_all(b"socks").await.unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"socks");
}

#[tokio::test]
async fn test_socks5_bad_version_closes_without_reply() {
    let local = start_local(RangeTable::default(), 9, "s3cret", FrontEnd::Socks5).await;

    let mut client = TcpStream::connect(("127.0.0.1", local)).await.unwrap();
    // exactly the greeting header the agent reads before giving up
    client.write_all(&[0x04, 0x01]).await.unwrap();
    let mut reply = Vec::new();
    match client.read_to_end(&mut reply).await {
        Ok(_) => assert!(reply.is_empty()),
        // a reset also means nothing was written back
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }
}

#[tokio::test]
async fn test_relay_dns_endpoint() {
    let (relay, _) = start_relay("s3cret").await;
    let resolver = RelayDnsResolver::new(Arc::new(relay_transport(relay, "s3cret")));

    let answer = resolver.lookup("localhost", 80).await;
    assert!(answer.addr.is_some_and(|addr| addr.is_loopback()));

    // a wrong secret gets the cover page, which is not an address
    let resolver = RelayDnsResolver::new(Arc::new(relay_transport(relay, "wrong")));
    assert!(!resolver.lookup("localhost", 80).await.is_hit());
}

#[tokio::test]
async fn test_tls_relay_tunnels_and_resolves() {
    let echo = echo_server().await;
    let (relay, _) = start_relay_with("s3cret", COVER_RESPONSE, Some(relay_tls_acceptor())).await;
    let transport = Arc::new(tls_relay_transport(relay, "s3cret", true));

    let tunnel = transport.open_tunnel(&Destination::new("127.0.0.1", echo)).await.unwrap();
    let mut stream = tunnel.stream;
    stream.write_all(b"sealed").await.unwrap();
    let mut echoed = [0u8; 6];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"sealed");

    let answer = RelayDnsResolver::new(transport).lookup("localhost", 80).await;
    assert!(answer.addr.is_some_and(|addr| addr.is_loopback()));
}

#[tokio::test]
async fn test_tls_relay_rejects_untrusted_and_plaintext_clients() {
    let (relay, _) = start_relay_with("s3cret", COVER_RESPONSE, Some(relay_tls_acceptor())).await;

    let untrusted = tls_relay_transport(relay, "s3cret", false)
        .open_tunnel(&Destination::new("127.0.0.1", 9))
        .await;
    assert!(matches!(untrusted, Err(Error::Tls(_))));

    let plaintext = relay_transport(relay, "s3cret")
        .open_tunnel(&Destination::new("127.0.0.1", 9))
        .await;
    assert!(plaintext.is_err());
}
