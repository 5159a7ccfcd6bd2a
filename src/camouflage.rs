//! Reverse proxy to the cover website. Anything reaching the relay
//! without the shared secret is answered from here.
//!
//! Request heads are rewritten to address the cover site; whatever the
//! cover site sends back is copied to the client untouched, as it arrives.
//! Each client connection gets its own cover connection, so keep-alive and
//! connection close follow the cover site.

use std::io::Cursor;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::async_tunnel::{copy_half, AsyncStream, BoxedStream};
use crate::core::observability;
use crate::direct_transport::dial_tcp;
use crate::error::{Error, Result};
use crate::http_head::{RequestHead, MAX_HEAD_LEN};
use crate::relay_transport::{DESTINATION_HEADER, DNS_QUERY_HEADER, SECRET_HEADER};
use crate::tls_wrapper::TlsWrapper;

const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

const COVER_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest chunk-size or trailer line we frame; anything longer is passed through raw.
const MAX_CHUNK_LINE: u64 = 4096;

const SENSITIVE_HEADERS: &[&str] = &[SECRET_HEADER, DESTINATION_HEADER, DNS_QUERY_HEADER];

enum NextHead {
    Parsed(RequestHead),
    /// Bytes that do not form a request head. They go to the cover site as-is.
    Raw(Vec<u8>),
    Closed,
}

pub struct CoverSite {
    base: reqwest::Url,
    host: String,
    port: u16,
    /// `Host` header value the cover site expects.
    authority: String,
    tls: Option<TlsWrapper>,
}

impl CoverSite {
    pub fn new(cover_website: &str) -> Result<Self> {
        let base = reqwest::Url::parse(cover_website)
            .map_err(|e| Error::config(format!("cover website {:?}: {}", cover_website, e)))?;
        let tls = match base.scheme() {
            "http" => None,
            "https" => Some(TlsWrapper::new()?),
            other => return Err(Error::config(format!("cover website scheme {:?}", other))),
        };
        let host = base
            .host_str()
            .ok_or_else(|| Error::config(format!("cover website {:?} has no host", cover_website)))?
            .to_string();
        let port = base
            .port_or_known_default()
            .ok_or_else(|| Error::config(format!("cover website {:?} has no port", cover_website)))?;
        let authority = match base.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            authority,
            base,
            tls,
        })
    }

    /// Joins the request path onto the cover site's base path.
    pub fn url_for(&self, head: &RequestHead) -> reqwest::Url {
        let origin = head.origin_form();
        let (path, query) = match origin.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (origin.as_str(), None),
        };

        let mut url = self.base.clone();
        let base_path = self.base.path().trim_end_matches('/');
        let path = if path.starts_with('/') {
            format!("{}{}", base_path, path)
        } else {
            format!("{}/{}", base_path, path)
        };
        url.set_path(&path);
        url.set_query(query);
        url
    }

    /// The head as the cover site should see it: no relay headers, the
    /// cover site's own host, and the target joined onto its base path.
    fn rewrite(&self, head: &RequestHead) -> Vec<u8> {
        let mut head = head.clone();
        for name in SENSITIVE_HEADERS {
            head.headers.remove(name);
        }
        if !head.is_connect() {
            let url = self.url_for(&head);
            head.target = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
            head.headers.set("Host", self.authority.as_str());
        }
        head.to_bytes()
    }

    async fn dial(&self) -> Result<BoxedStream> {
        let tcp = dial_tcp(&self.host, self.port, COVER_DIAL_TIMEOUT).await?;
        let stream: BoxedStream = match &self.tls {
            Some(tls) => Box::new(tls.connect(tcp, &self.host).await?),
            None => Box::new(tcp),
        };
        Ok(stream)
    }

    /// Proxies `client` to the cover site, starting with `head`, until the
    /// cover site is done answering.
    pub async fn serve<S: AsyncStream>(&self, client: S, head: RequestHead, leftover: Vec<u8>) -> Result<()> {
        let first = self.rewrite(&head);
        self.splice(client, first, leftover, Some(head)).await
    }

    /// Hands bytes that never formed a request head to the cover site, so
    /// it answers them the way it answers anyone.
    pub async fn serve_raw<S: AsyncStream>(&self, client: S, received: Vec<u8>) -> Result<()> {
        self.splice(client, received, Vec::new(), None).await
    }

    async fn splice<S: AsyncStream>(
        &self,
        mut client: S,
        initial: Vec<u8>,
        leftover: Vec<u8>,
        head: Option<RequestHead>,
    ) -> Result<()> {
        let mut cover = match self.dial().await {
            Ok(cover) => cover,
            Err(e) => {
                tracing::debug!("cover site unreachable: {}", e);
                client.write_all(BAD_GATEWAY).await?;
                client.flush().await?;
                let _ = client.shutdown().await;
                return Ok(());
            }
        };
        observability::record_camouflage_served();
        cover.write_all(&initial).await?;
        cover.flush().await?;

        let (client_read, mut client_write) = tokio::io::split(client);
        let (mut cover_read, mut cover_write) = tokio::io::split(cover);
        let mut inbound = BufReader::new(Cursor::new(leftover).chain(client_read));

        let requests = async {
            let result = match head {
                Some(head) => self.forward_requests(&mut inbound, &mut cover_write, head).await,
                None => {
                    pass_through(&mut inbound, &mut cover_write).await;
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::debug!("camouflage request stream ended: {}", e);
            }
            let _ = cover_write.shutdown().await;
            // the session lasts until the cover site closes its side
            std::future::pending::<()>().await
        };
        let mut received = 0u64;
        let responses = async {
            copy_half(&mut cover_read, &mut client_write, &mut received).await;
            let _ = client_write.shutdown().await;
        };

        tokio::select! {
            _ = requests => {},
            _ = responses => {},
        }
        tracing::debug!(bytes = received, "camouflage session closed");
        Ok(())
    }

    /// Sends every request after the first to the cover site, keeping
    /// HTTP/1.1 framing so each head can be rewritten.
    async fn forward_requests<R, W>(&self, inbound: &mut R, cover: &mut W, first: RequestHead) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut head = first;
        loop {
            if head.is_connect() || head.headers.get("Upgrade").is_some() {
                // no HTTP framing past this point
                pass_through(inbound, cover).await;
                return Ok(());
            }
            if let Err(e) = forward_body(inbound, cover, &head).await {
                tracing::debug!("unframed request body: {}", e);
                pass_through(inbound, cover).await;
                return Ok(());
            }

            head = match next_head(inbound).await? {
                NextHead::Parsed(head) => head,
                NextHead::Raw(bytes) => {
                    cover.write_all(&bytes).await?;
                    pass_through(inbound, cover).await;
                    return Ok(());
                }
                NextHead::Closed => return Ok(()),
            };
            cover.write_all(&self.rewrite(&head)).await?;
            cover.flush().await?;
        }
    }
}

async fn pass_through<R, W>(inbound: &mut R, cover: &mut W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sent = 0u64;
    copy_half(inbound, cover, &mut sent).await;
}

async fn next_head<R>(inbound: &mut R) -> Result<NextHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    loop {
        let budget = (MAX_HEAD_LEN + 1).saturating_sub(raw.len()) as u64;
        let start = raw.len();
        let n = (&mut *inbound).take(budget).read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Ok(if raw.is_empty() { NextHead::Closed } else { NextHead::Raw(raw) });
        }
        let line = &raw[start..];
        if start > 0 && (line == b"\r\n" || line == b"\n") {
            break;
        }
        if raw.len() > MAX_HEAD_LEN || !raw.ends_with(b"\n") {
            return Ok(NextHead::Raw(raw));
        }
    }

    Ok(match RequestHead::parse(&raw) {
        Ok(head) => NextHead::Parsed(head),
        Err(_) => NextHead::Raw(raw),
    })
}

/// Copies one request body, framed by `Transfer-Encoding: chunked` or
/// `Content-Length`. A request with neither has no body.
async fn forward_body<R, W>(inbound: &mut R, cover: &mut W, head: &RequestHead) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let chunked = head
        .headers
        .get("Transfer-Encoding")
        .is_some_and(|coding| coding.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return forward_chunked(inbound, cover).await;
    }
    match head.headers.content_length() {
        Some(len) => copy_exact(inbound, cover, len as u64).await,
        None if head.headers.get("Content-Length").is_some() => Err(Error::address("bad Content-Length")),
        None => Ok(()),
    }
}

async fn forward_chunked<R, W>(inbound: &mut R, cover: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        forward_line(inbound, cover, &mut line).await?;
        let size = chunk_size(&line)?;
        if size == 0 {
            break;
        }
        let framed = size
            .checked_add(2)
            .ok_or_else(|| Error::address("chunk size overflow"))?;
        copy_exact(inbound, cover, framed).await?;
    }
    // trailers end at a blank line
    loop {
        forward_line(inbound, cover, &mut line).await?;
        if line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
    }
}

/// Reads one line into `line` and passes it on, whole or not.
async fn forward_line<R, W>(inbound: &mut R, cover: &mut W, line: &mut Vec<u8>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    line.clear();
    (&mut *inbound).take(MAX_CHUNK_LINE).read_until(b'\n', line).await?;
    cover.write_all(line).await?;
    if !line.ends_with(b"\n") {
        return Err(Error::address("unterminated chunk line"));
    }
    Ok(())
}

fn chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| Error::address("chunk size is not UTF-8"))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16).map_err(|_| Error::address(format!("bad chunk size {:?}", digits)))
}

async fn copy_exact<R, W>(inbound: &mut R, cover: &mut W, len: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *inbound).take(len), cover).await?;
    if copied < len {
        return Err(Error::address("request body cut short"));
    }
    Ok(())
}
