//! Sorted address-range tables with a floor-search containment test.
//!
//! Ranges are kept as `IpAddr` pairs. `IpAddr` orders every IPv4 address
//! before every IPv6 address and compares within a family as big-endian
//! unsigned bytes, so a single table can hold both families without an
//! IPv4 address ever landing inside an IPv6 range.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Loopback, RFC1918, link-local, CGNAT and their IPv6 counterparts.
const PRIVATE_CIDRS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

lazy_static! {
    /// Private-network table used to disambiguate private DNS answers.
    pub static ref PRIVATE_RANGES: RangeTable = RangeTable::from_ranges(
        PRIVATE_CIDRS
            .iter()
            .filter_map(|cidr| AddressRange::parse(cidr).ok())
            .collect()
    );
}

/// Inclusive `[low, high]` block derived from one CIDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub low: IpAddr,
    pub high: IpAddr,
}

impl AddressRange {
    pub fn parse(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::address(format!("missing prefix length in {:?}", cidr)))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::address(format!("bad network address in {:?}", cidr)))?;
        let prefix: u32 = prefix
            .parse()
            .map_err(|_| Error::address(format!("bad prefix length in {:?}", cidr)))?;

        match addr {
            IpAddr::V4(v4) => Self::v4(v4, prefix),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) if prefix >= 96 => Self::v4(v4, prefix - 96),
                _ => Self::v6(v6, prefix),
            },
        }
        .ok_or_else(|| Error::address(format!("prefix length out of range in {:?}", cidr)))
    }

    fn v4(addr: Ipv4Addr, prefix: u32) -> Option<Self> {
        if prefix > 32 {
            return None;
        }
        let host_mask = u32::MAX.checked_shr(prefix).unwrap_or(0);
        let bits = u32::from(addr);
        Some(Self {
            low: IpAddr::V4(Ipv4Addr::from(bits & !host_mask)),
            high: IpAddr::V4(Ipv4Addr::from(bits | host_mask)),
        })
    }

    fn v6(addr: Ipv6Addr, prefix: u32) -> Option<Self> {
        if prefix > 128 {
            return None;
        }
        let host_mask = u128::MAX.checked_shr(prefix).unwrap_or(0);
        let bits = u128::from(addr);
        Some(Self {
            low: IpAddr::V6(Ipv6Addr::from(bits & !host_mask)),
            high: IpAddr::V6(Ipv6Addr::from(bits | host_mask)),
        })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.low <= addr && addr <= self.high
    }
}

/// Immutable table of ranges sorted ascending by `high`.
///
/// Ranges are expected to be non-overlapping; nothing merges or
/// deduplicates them.
#[derive(Debug, Clone, Default)]
pub struct RangeTable {
    ranges: Vec<AddressRange>,
}

impl RangeTable {
    /// Parses every CIDR, skipping malformed ones. Fails only when nothing parsed.
    pub fn build<I, S>(cidrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ranges = Vec::new();
        for cidr in cidrs {
            match AddressRange::parse(cidr.as_ref()) {
                Ok(range) => ranges.push(range),
                Err(e) => tracing::debug!("skipping range: {}", e),
            }
        }
        if ranges.is_empty() {
            return Err(Error::EmptyFeed);
        }
        Ok(Self::from_ranges(ranges))
    }

    pub fn from_ranges(mut ranges: Vec<AddressRange>) -> Self {
        ranges.sort_by(|a, b| a.high.cmp(&b.high));
        Self { ranges }
    }

    /// `None` (an unresolved or unparsable address) is never contained.
    pub fn contains(&self, addr: impl Into<Option<IpAddr>>) -> bool {
        let Some(addr) = addr.into() else {
            return false;
        };
        let addr = addr.to_canonical();

        // first range whose high >= addr
        let idx = self.ranges.partition_point(|r| r.high < addr);
        match self.ranges.get(idx) {
            Some(range) => range.low <= addr,
            None => false,
        }
    }

    /// Literal-address check for a host string; bracketed IPv6 is accepted.
    pub fn contains_host(&self, host: &str) -> bool {
        self.contains(parse_ip_literal(host))
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Parses `1.2.3.4`, `::1` or `[::1]`.
pub fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

/// A range table that is swapped wholesale on refresh.
///
/// Readers hold the lock for one lookup; the writer only replaces the
/// `Arc`, so a snapshot taken before a swap stays valid and sorted.
#[derive(Debug, Default)]
pub struct SharedRangeTable {
    inner: RwLock<Arc<RangeTable>>,
}

impl SharedRangeTable {
    pub fn new(table: RangeTable) -> Self {
        Self {
            inner: RwLock::new(Arc::new(table)),
        }
    }

    pub fn contains(&self, addr: impl Into<Option<IpAddr>>) -> bool {
        self.inner.read().contains(addr)
    }

    pub fn contains_host(&self, host: &str) -> bool {
        self.inner.read().contains_host(host)
    }

    pub fn snapshot(&self) -> Arc<RangeTable> {
        Arc::clone(&self.inner.read())
    }

    pub fn replace(&self, table: RangeTable) {
        let table = Arc::new(table);
        *self.inner.write() = table;
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_low_never_exceeds_high() {
        for cidr in [
            "1.0.1.0/24",
            "0.0.0.0/0",
            "255.255.255.255/32",
            "10.1.2.3/8",
            "2001:da8::/32",
            "::/0",
            "::1/128",
            "::ffff:1.2.3.0/120",
        ] {
            let table = RangeTable::build([cidr]).unwrap();
            let range = table.ranges()[0];
            assert!(range.low <= range.high, "{}", cidr);
        }
    }

    #[test]
    fn test_host_bits_are_masked() {
        let range = AddressRange::parse("10.1.2.3/8").unwrap();
        assert_eq!(range.low, ip("10.0.0.0"));
        assert_eq!(range.high, ip("10.255.255.255"));

        let range = AddressRange::parse("2001:da8:1001::/48").unwrap();
        assert_eq!(range.low, ip("2001:da8:1001::"));
        assert_eq!(range.high, ip("2001:da8:1001:ffff:ffff:ffff:ffff:ffff"));
    }

    #[test]
    fn test_mapped_cidr_becomes_ipv4() {
        let range = AddressRange::parse("::ffff:1.2.3.0/120").unwrap();
        assert_eq!(range.low, ip("1.2.3.0"));
        assert_eq!(range.high, ip("1.2.3.255"));
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let table = RangeTable::build(["1.0.1.0/24", "garbage", "1.2.3.4/33", "1.0.8.0"]).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_empty_build_fails() {
        assert!(matches!(RangeTable::build(["nope"]), Err(Error::EmptyFeed)));
        assert!(matches!(RangeTable::build(Vec::<String>::new()), Err(Error::EmptyFeed)));
    }

    #[test]
    fn test_contains_inclusive_bounds() {
        let table =
            RangeTable::build(["1.0.8.0/21", "1.0.1.0/24", "2001:da8::/32", "223.255.252.0/23"])
                .unwrap();

        assert!(table.contains(ip("1.0.1.0")));
        assert!(table.contains(ip("1.0.1.5")));
        assert!(table.contains(ip("1.0.1.255")));
        assert!(table.contains(ip("1.0.15.255")));
        assert!(table.contains(ip("223.255.253.1")));
        assert!(table.contains(ip("2001:da8:1001:7::88")));

        assert!(!table.contains(ip("1.0.0.255")));
        assert!(!table.contains(ip("1.0.2.5")));
        assert!(!table.contains(ip("1.0.16.0")));
        assert!(!table.contains(ip("172.217.11.68")));
        assert!(!table.contains(ip("2001:db8::1")));
        assert!(!table.contains(None));
    }

    #[test]
    fn test_contains_matches_linear_scan() {
        let table = RangeTable::build(["1.0.1.0/24", "1.0.8.0/21", "36.96.0.0/11", "240e::/20"])
            .unwrap();
        for probe in [
            "0.0.0.0", "1.0.0.1", "1.0.1.128", "1.0.7.255", "1.0.8.0", "36.100.1.1", "36.128.0.0",
            "240e:1::1", "240f::", "::1",
        ] {
            let addr = ip(probe);
            let expected = table.ranges().iter().any(|r| r.contains(addr));
            assert_eq!(table.contains(addr), expected, "{}", probe);
        }
    }

    #[test]
    fn test_ipv4_never_falls_inside_ipv6_range() {
        // 32.1.5.5 shares its leading bytes with 2001::/16
        let table = RangeTable::build(["2001::/16"]).unwrap();
        assert!(!table.contains(ip("32.1.5.5")));
    }

    #[test]
    fn test_mapped_address_normalized() {
        let table = RangeTable::build(["1.0.1.0/24"]).unwrap();
        assert!(table.contains(ip("::ffff:1.0.1.7")));
        assert!(table.contains_host("1.0.1.7"));
        assert!(!table.contains_host("example.com"));
    }

    #[test]
    fn test_private_ranges() {
        assert!(PRIVATE_RANGES.contains(ip("127.0.0.1")));
        assert!(PRIVATE_RANGES.contains(ip("192.168.1.10")));
        assert!(PRIVATE_RANGES.contains(ip("172.31.255.255")));
        assert!(PRIVATE_RANGES.contains(ip("fd00::1")));
        assert!(PRIVATE_RANGES.contains_host("[::1]"));
        assert!(!PRIVATE_RANGES.contains(ip("172.32.0.1")));
        assert!(!PRIVATE_RANGES.contains(ip("8.8.8.8")));
    }

    #[test]
    fn test_swap_keeps_old_snapshot_valid() {
        let shared = SharedRangeTable::new(RangeTable::build(["1.0.1.0/24"]).unwrap());
        let before = shared.snapshot();

        shared.replace(RangeTable::build(["8.8.8.0/24"]).unwrap());

        assert!(before.contains(ip("1.0.1.1")));
        assert!(!shared.contains(ip("1.0.1.1")));
        assert!(shared.contains(ip("8.8.8.8")));
        assert_eq!(shared.len(), 1);
    }
}
