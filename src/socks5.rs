//! The CONNECT-only, no-auth subset of SOCKS5 (RFC 1928).
//!
//! Any frame outside the subset is an error; the caller drops the stream
//! without writing a reply.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::routing::Destination;

pub const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Success with a zeroed IPv4 bind address. Sent before the dial.
pub const SUCCESS_REPLY: [u8; 10] = [VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub addr: TargetAddr,
    pub port: u16,
}

impl ConnectRequest {
    pub fn destination(&self) -> Destination {
        let host = match &self.addr {
            TargetAddr::Ipv4(ip) => ip.to_string(),
            TargetAddr::Domain(name) => name.clone(),
            TargetAddr::Ipv6(ip) => ip.to_string(),
        };
        Destination::new(host, self.port)
    }
}

fn truncated(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::address("truncated socks5 frame")
    } else {
        Error::Io(e)
    }
}

/// Method negotiation. Whatever the client offers, "no auth" is chosen.
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await.map_err(truncated)?;
    if greeting[0] != VERSION {
        return Err(Error::address(format!("socks version {:#04x}", greeting[0])));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await.map_err(truncated)?;

    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_request<R>(reader: &mut R) -> Result<ConnectRequest>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await.map_err(truncated)?;
    let [version, command, _reserved, atyp] = head;
    if version != VERSION {
        return Err(Error::address(format!("socks version {:#04x}", version)));
    }
    if command != CMD_CONNECT {
        return Err(Error::address(format!("unsupported socks command {:#04x}", command)));
    }

    let addr = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await.map_err(truncated)?;
            TargetAddr::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await.map_err(truncated)? as usize;
            if len == 0 {
                return Err(Error::address("empty socks domain"));
            }
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await.map_err(truncated)?;
            let name = String::from_utf8(name).map_err(|_| Error::address("socks domain is not utf-8"))?;
            TargetAddr::Domain(name)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await.map_err(truncated)?;
            TargetAddr::Ipv6(Ipv6Addr::from(octets))
        }
        other => return Err(Error::address(format!("unsupported socks address type {:#04x}", other))),
    };
    let port = reader.read_u16().await.map_err(truncated)?;

    Ok(ConnectRequest { addr, port })
}

/// Negotiates, reads the CONNECT request and acknowledges it.
pub async fn accept<S>(stream: &mut S) -> Result<ConnectRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(stream).await?;
    let request = read_request(stream).await?;
    stream.write_all(&SUCCESS_REPLY).await?;
    stream.flush().await?;
    Ok(request)
}
