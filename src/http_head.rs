//! Minimal HTTP/1.x head handling for the proxy front end and the relay hop.
//!
//! Only the head is parsed; bodies are either piped untouched or read by
//! `Content-Length`.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub const MAX_HEAD_LEN: usize = 64 * 1024;

/// Ordered header list; names compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces every existing `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.0.push((name.to_string(), value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Removes every `name`, returning the first value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut first = None;
        self.0.retain(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if first.is_none() {
                    first = Some(v.clone());
                }
                false
            } else {
                true
            }
        });
        first
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get("Content-Length")?.trim().parse().ok()
    }

    fn write_to(&self, out: &mut String) {
        for (name, value) in &self.0 {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }

    fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Self> {
        let mut headers = HeaderList::default();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::address(format!("malformed header line {:?}", line)))?;
            headers.append(name.trim(), value.trim());
        }
        Ok(headers)
    }
}

/// Outcome of reading a head when the bytes must not be lost on failure.
pub enum HeadRead {
    /// The head (terminator included) and any bytes read past it.
    Complete { raw: Vec<u8>, leftover: Vec<u8> },
    /// The peer closed, or the head grew past `MAX_HEAD_LEN`; everything read so far.
    Partial(Vec<u8>),
}

/// Reads until the blank line that ends an HTTP head.
/// Returns the head (terminator included) and any bytes read past it.
pub async fn read_head<R>(reader: &mut R) -> Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    match read_head_or_partial(reader).await? {
        HeadRead::Complete { raw, leftover } => Ok((raw, leftover)),
        HeadRead::Partial(buf) if buf.len() > MAX_HEAD_LEN => Err(Error::address("HTTP head too large")),
        HeadRead::Partial(_) => Err(Error::address("connection closed before end of HTTP head")),
    }
}

pub async fn read_head_or_partial<R>(reader: &mut R) -> Result<HeadRead>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(HeadRead::Partial(buf));
        }
        // the terminator may straddle two reads
        let search_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_terminator(&buf[search_from..]) {
            let end = search_from + pos + 4;
            let leftover = buf.split_off(end);
            return Ok(HeadRead::Complete { raw: buf, leftover });
        }
        if buf.len() > MAX_HEAD_LEN {
            return Ok(HeadRead::Partial(buf));
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: HeaderList,
}

impl RequestHead {
    pub fn new(method: &str, target: &str) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: HeaderList::default(),
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| Error::address("HTTP head is not UTF-8"))?;
        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
            return Err(Error::address(format!("malformed request line {:?}", request_line)));
        }

        Ok(Self {
            method: parts[0].to_string(),
            target: parts[1].to_string(),
            version: parts[2].to_string(),
            headers: HeaderList::parse_lines(lines)?,
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Host and port the client wants to reach.
    ///
    /// CONNECT uses its authority target (port 443 when absent); other
    /// methods use the absolute-form URI or the Host header (port 80).
    pub fn destination(&self) -> Result<(String, u16)> {
        if self.is_connect() {
            return split_host_port(&self.target, 443);
        }
        if let Some(rest) = self.target.strip_prefix("http://") {
            let authority = rest.split(['/', '?']).next().unwrap_or_default();
            return split_host_port(authority, 80);
        }
        match self.headers.get("Host") {
            Some(host) => split_host_port(host, 80),
            None => Err(Error::address("request has no Host header")),
        }
    }

    /// `/path?query` form of the target; absolute URIs lose scheme and authority.
    pub fn origin_form(&self) -> String {
        match self.target.strip_prefix("http://").or_else(|| self.target.strip_prefix("https://")) {
            Some(rest) => match rest.find(['/', '?']) {
                Some(idx) if rest[idx..].starts_with('/') => rest[idx..].to_string(),
                Some(idx) => format!("/{}", &rest[idx..]),
                None => "/".to_string(),
            },
            None => self.target.clone(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        self.headers.write_to(&mut out);
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// The request as an origin server expects it: origin-form target, a
    /// Host header, and no proxy-only headers.
    pub fn to_origin_bytes(&self) -> Result<Vec<u8>> {
        let mut origin = self.clone();
        if origin.headers.get("Host").is_none() {
            let (host, port) = self.destination()?;
            let host = if port == 80 { bracket_host(&host) } else { join_host_port(&host, port) };
            origin.headers.set("Host", host);
        }
        origin.target = self.origin_form();
        origin.headers.remove("Proxy-Connection");
        origin.headers.remove("Proxy-Authorization");
        Ok(origin.to_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderList,
}

impl ResponseHead {
    pub fn new(status: u16, reason: &str) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason.to_string(),
            headers: HeaderList::default(),
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| Error::address("HTTP head is not UTF-8"))?;
        let mut lines = text.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(Error::address(format!("malformed status line {:?}", status_line)));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| Error::address(format!("malformed status line {:?}", status_line)))?;

        Ok(Self {
            version: version.to_string(),
            status,
            reason: parts.next().unwrap_or_default().to_string(),
            headers: HeaderList::parse_lines(lines)?,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.version, self.status, self.reason);
        self.headers.write_to(&mut out);
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Splits `host:port`, `[v6]:port`, `[v6]`, bare `v6` or bare `host`.
pub fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err(Error::address("empty authority"));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| Error::address(format!("unclosed bracket in {:?}", authority)))?;
        let port = match after.strip_prefix(':') {
            Some(port) => parse_port(port, authority)?,
            None if after.is_empty() => default_port,
            None => return Err(Error::address(format!("junk after bracket in {:?}", authority))),
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        // more than one colon without brackets: a bare IPv6 literal
        Some((host, _)) if host.contains(':') => Ok((authority.to_string(), default_port)),
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), parse_port(port, authority)?)),
        Some(_) => Err(Error::address(format!("missing host in {:?}", authority))),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn parse_port(port: &str, authority: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::address(format!("bad port in {:?}", authority)))
}

fn bracket_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Inverse of `split_host_port`; IPv6 hosts are bracketed.
pub fn join_host_port(host: &str, port: u16) -> String {
    format!("{}:{}", bracket_host(host), port)
}
