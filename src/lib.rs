//! Split-routing proxy. The local agent sends traffic for listed address
//! ranges straight to its destination and everything else through a relay
//! agent, which answers unauthenticated visitors with a cover website.

pub mod async_tunnel;
pub mod camouflage;
pub mod config;
pub mod core;
pub mod direct_transport;
pub mod dns_cache;
pub mod dns_resolver;
pub mod error;
pub mod http_head;
pub mod ip_feed;
pub mod ip_range;
pub mod local_proxy;
pub mod logging;
pub mod relay_transport;
pub mod remote_proxy;
pub mod routing;
pub mod smart_dns;
pub mod socks5;
pub mod tls_wrapper;

#[cfg(test)]
mod end_to_end_tests;

pub use error::{Error, Result};
